//! Hybrid search combining vector similarity and BM25.
//!
//! Both sub-indexes are queried concurrently with over-fetch, each side's
//! scores are min-max normalized, and chunks found by both sides have their
//! normalized scores combined by weighted sum. If one side fails the other
//! side's results are returned on their own.

pub mod bm25;

pub use bm25::Bm25Corpus;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::chunker::ChunkKey;
use crate::index::{ChunkHit, ChunkIndex, StoreError};

/// A fused search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    /// File the chunk belongs to
    pub source_path: PathBuf,
    /// Position of the chunk within the file
    pub sequence_index: usize,
    /// The chunk text
    pub text: String,
    /// Fused relevance score in [0, 1] (higher is better)
    pub score: f32,
    /// Normalized vector similarity, if the vector side returned this chunk
    pub vector_score: Option<f32>,
    /// Normalized BM25 score, if the keyword side returned this chunk
    pub keyword_score: Option<f32>,
    /// File-level summary, if one was generated
    pub summary: Option<String>,
}

impl ScoredResult {
    fn key(&self) -> (&PathBuf, usize) {
        (&self.source_path, self.sequence_index)
    }
}

/// Configuration for hybrid search.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Weight for vector similarity
    pub vector_weight: f32,
    /// Weight for BM25
    pub keyword_weight: f32,
    /// Each side fetches `k * overfetch` candidates
    pub overfetch: usize,
    /// Drop fused results scoring below this
    pub min_score: Option<f32>,
    /// Per-file cap applied by `ask_context`
    pub max_chunks_per_file: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
            overfetch: 3,
            min_score: None,
            max_chunks_per_file: 3,
        }
    }
}

impl RetrievalConfig {
    /// Weights scaled to sum to one.
    fn normalized_weights(&self) -> (f32, f32) {
        let v = self.vector_weight.max(0.0);
        let k = self.keyword_weight.max(0.0);
        let total = v + k;
        if total <= f32::EPSILON {
            (0.5, 0.5)
        } else {
            (v / total, k / total)
        }
    }
}

/// Errors surfaced by the retriever.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Both indexes failed: vector: {vector}; keyword: {keyword}")]
    Unavailable {
        vector: StoreError,
        keyword: StoreError,
    },
}

/// Min-max normalize scores into [0, 1]. A single candidate, or candidates
/// that all share one score, normalize to 1.0.
pub fn normalize_scores(hits: &[ChunkHit]) -> Vec<f32> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);

    hits.iter()
        .map(|h| {
            if (max - min).abs() < f32::EPSILON {
                1.0
            } else {
                (h.score - min) / (max - min)
            }
        })
        .collect()
}

/// Fuse two candidate lists into one ranking.
///
/// Each side is normalized independently; a chunk's fused score is
/// `vector_weight * v + keyword_weight * k` with a missing side counting as
/// zero. With weights summing to one, a chunk found by both sides always
/// scores at least the lower of its two normalized scores. Ordering is by
/// descending score, then path, then sequence index.
pub fn fuse(
    vector_hits: &[ChunkHit],
    keyword_hits: &[ChunkHit],
    vector_weight: f32,
    keyword_weight: f32,
) -> Vec<ScoredResult> {
    let mut merged: HashMap<ChunkKey, ScoredResult> = HashMap::new();

    for (hit, norm) in vector_hits.iter().zip(normalize_scores(vector_hits)) {
        let entry = merged.entry(hit.key.clone()).or_insert_with(|| empty_result(hit));
        entry.vector_score = Some(entry.vector_score.map_or(norm, |s| s.max(norm)));
    }
    for (hit, norm) in keyword_hits.iter().zip(normalize_scores(keyword_hits)) {
        let entry = merged.entry(hit.key.clone()).or_insert_with(|| empty_result(hit));
        entry.keyword_score = Some(entry.keyword_score.map_or(norm, |s| s.max(norm)));
        if entry.summary.is_none() {
            entry.summary = hit.summary.clone();
        }
    }

    let mut results: Vec<ScoredResult> = merged
        .into_values()
        .map(|mut r| {
            r.score = vector_weight * r.vector_score.unwrap_or(0.0)
                + keyword_weight * r.keyword_score.unwrap_or(0.0);
            r
        })
        .collect();
    sort_results(&mut results);
    results
}

fn empty_result(hit: &ChunkHit) -> ScoredResult {
    ScoredResult {
        source_path: hit.key.path.clone(),
        sequence_index: hit.key.sequence_index,
        text: hit.text.clone(),
        score: 0.0,
        vector_score: None,
        keyword_score: None,
        summary: hit.summary.clone(),
    }
}

fn sort_results(results: &mut [ScoredResult]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key().cmp(&b.key())));
}

/// Hybrid searcher over a vector index and a keyword index.
pub struct HybridRetriever {
    config: RetrievalConfig,
    vector: Arc<dyn ChunkIndex>,
    keyword: Arc<dyn ChunkIndex>,
}

impl HybridRetriever {
    pub fn new(
        config: RetrievalConfig,
        vector: Arc<dyn ChunkIndex>,
        keyword: Arc<dyn ChunkIndex>,
    ) -> Self {
        Self {
            config,
            vector,
            keyword,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Fused ranking over `fetch` candidates per side, floor applied, not truncated.
    async fn ranked(&self, query: &str, fetch: usize) -> Result<Vec<ScoredResult>, SearchError> {
        let (vector, keyword) = tokio::join!(
            self.vector.query(query, fetch),
            self.keyword.query(query, fetch)
        );

        let (vw, kw) = self.config.normalized_weights();
        let mut results = match (vector, keyword) {
            (Ok(v), Ok(k)) => {
                debug!(vector = v.len(), keyword = k.len(), "Fusing candidates");
                fuse(&v, &k, vw, kw)
            }
            (Err(e), Ok(k)) => {
                warn!(error = %e, "Vector search failed, degrading to keyword-only results");
                fuse(&[], &k, 0.0, 1.0)
            }
            (Ok(v), Err(e)) => {
                warn!(error = %e, "Keyword search failed, degrading to vector-only results");
                fuse(&v, &[], 1.0, 0.0)
            }
            (Err(vector), Err(keyword)) => {
                return Err(SearchError::Unavailable { vector, keyword });
            }
        };

        if let Some(floor) = self.config.min_score {
            results.retain(|r| r.score >= floor);
        }
        Ok(results)
    }

    fn fetch_limit(&self, k: usize) -> usize {
        k.saturating_mul(self.config.overfetch.max(1))
    }

    /// Top `k` chunks for `query`. An empty index yields an empty list.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredResult>, SearchError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut results = self.ranked(query, self.fetch_limit(k)).await?;
        results.truncate(k);
        debug!("Search for {:?} returned {} results", query, results.len());
        Ok(results)
    }

    /// Like [`search`](Self::search), but spreads results across files:
    /// at most `max_chunks_per_file` chunks per file, back-filled from the
    /// fused ranking when fewer than `k` remain.
    pub async fn ask_context(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredResult>, SearchError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let ranked = self.ranked(query, self.fetch_limit(k)).await?;
        Ok(cap_per_file(ranked, k, self.config.max_chunks_per_file))
    }
}

/// Select up to `k` results with at most `cap` per file, then back-fill in
/// rank order. Input must already be ranked; output keeps that order.
fn cap_per_file(ranked: Vec<ScoredResult>, k: usize, cap: usize) -> Vec<ScoredResult> {
    let cap = cap.max(1);
    let mut per_file: HashMap<PathBuf, usize> = HashMap::new();
    let mut chosen: HashSet<usize> = HashSet::new();

    for (i, r) in ranked.iter().enumerate() {
        if chosen.len() == k {
            break;
        }
        let n = per_file.entry(r.source_path.clone()).or_insert(0);
        if *n < cap {
            *n += 1;
            chosen.insert(i);
        }
    }
    for i in 0..ranked.len() {
        if chosen.len() == k {
            break;
        }
        chosen.insert(i);
    }

    ranked
        .into_iter()
        .enumerate()
        .filter(|(i, _)| chosen.contains(i))
        .map(|(_, r)| r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::index::{KeywordIndex, LocalVectorIndex};
    use crate::testing::AxisEmbedder;
    use std::path::Path;

    fn hit(path: &str, seq: usize, score: f32) -> ChunkHit {
        ChunkHit {
            key: ChunkKey::new(path, seq),
            text: format!("{}#{}", path, seq),
            score,
            summary: None,
        }
    }

    #[test]
    fn test_retrieval_config_default() {
        let config = RetrievalConfig::default();
        assert!((config.vector_weight - 0.7).abs() < f32::EPSILON);
        assert!((config.keyword_weight - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.overfetch, 3);
        assert!(config.min_score.is_none());
    }

    #[test]
    fn test_normalized_weights() {
        let config = RetrievalConfig {
            vector_weight: 3.0,
            keyword_weight: 1.0,
            ..Default::default()
        };
        assert_eq!(config.normalized_weights(), (0.75, 0.25));
    }

    #[test]
    fn test_normalize_scores() {
        let hits = vec![hit("/a", 0, 10.0), hit("/b", 0, 5.0), hit("/c", 0, 0.0)];
        assert_eq!(normalize_scores(&hits), vec![1.0, 0.5, 0.0]);
        assert_eq!(normalize_scores(&[hit("/a", 0, 3.0)]), vec![1.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_fusion_rewards_combined_evidence() {
        // /both normalizes to 0.8 (vector) and 0.6 (keyword); /single only
        // appears on the vector side with the top score.
        let vector = vec![hit("/single", 0, 1.0), hit("/both", 0, 0.8), hit("/low", 0, 0.0)];
        let keyword = vec![hit("/kw", 0, 10.0), hit("/both", 0, 6.0), hit("/kw2", 0, 0.0)];

        let fused = fuse(&vector, &keyword, 0.7, 0.3);
        let both = fused.iter().position(|r| r.source_path == Path::new("/both")).unwrap();
        let single = fused.iter().position(|r| r.source_path == Path::new("/single")).unwrap();

        assert!(both < single);
        let both_score = fused[both].score;
        assert!((both_score - (0.7 * 0.8 + 0.3 * 0.6)).abs() < 1e-6);
        assert!(both_score >= 0.6);
    }

    #[test]
    fn test_fusion_never_below_lower_source_score() {
        let vector = vec![hit("/x", 0, 0.9), hit("/y", 0, 0.1), hit("/z", 0, 0.5)];
        let keyword = vec![hit("/y", 0, 8.0), hit("/x", 0, 1.0), hit("/z", 0, 4.0)];

        for r in fuse(&vector, &keyword, 0.7, 0.3) {
            let lower = r.vector_score.unwrap().min(r.keyword_score.unwrap());
            assert!(r.score + 1e-6 >= lower, "{:?}", r);
        }
    }

    #[test]
    fn test_fusion_dedups_by_chunk_identity() {
        let vector = vec![hit("/a", 0, 0.9), hit("/a", 1, 0.5)];
        let keyword = vec![hit("/a", 1, 2.0), hit("/a", 0, 1.0)];

        let fused = fuse(&vector, &keyword, 0.7, 0.3);
        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|r| r.vector_score.is_some() && r.keyword_score.is_some()));
    }

    #[test]
    fn test_fusion_tie_break_is_path_then_sequence() {
        let vector = vec![hit("/b", 0, 1.0), hit("/a", 2, 1.0), hit("/a", 1, 1.0)];
        let fused = fuse(&vector, &[], 1.0, 0.0);

        let order: Vec<(String, usize)> = fused
            .iter()
            .map(|r| (r.source_path.display().to_string(), r.sequence_index))
            .collect();
        assert_eq!(
            order,
            vec![("/a".to_string(), 1), ("/a".to_string(), 2), ("/b".to_string(), 0)]
        );
    }

    #[test]
    fn test_cap_per_file_backfills() {
        let ranked = fuse(
            &[
                hit("/a", 0, 1.0),
                hit("/a", 1, 0.9),
                hit("/a", 2, 0.8),
                hit("/b", 0, 0.1),
            ],
            &[],
            1.0,
            0.0,
        );

        let capped = cap_per_file(ranked.clone(), 2, 1);
        let paths: Vec<&Path> = capped.iter().map(|r| r.source_path.as_path()).collect();
        assert_eq!(paths, vec![Path::new("/a"), Path::new("/b")]);

        let backfilled = cap_per_file(ranked, 3, 1);
        assert_eq!(backfilled.len(), 3);
        assert_eq!(backfilled[1].sequence_index, 1);
    }

    async fn retriever(embedder: Arc<AxisEmbedder>, config: RetrievalConfig) -> HybridRetriever {
        let vector = Arc::new(LocalVectorIndex::in_memory(embedder));
        let keyword = Arc::new(KeywordIndex::in_memory());
        let chunker = Chunker::default();

        for (path, text) in [
            ("/d/zoo.txt", "zebra stripes on the savanna"),
            ("/d/cars.txt", "engine wheels and gearbox"),
        ] {
            let chunks = chunker.chunk(Path::new(path), text);
            vector.add(&chunks, Some("summary")).await.unwrap();
            keyword.add(&chunks, Some("summary")).await.unwrap();
        }
        HybridRetriever::new(config, vector, keyword)
    }

    fn animal_embedder() -> Arc<AxisEmbedder> {
        Arc::new(AxisEmbedder::new(&[
            &["zebra", "stripes", "savanna", "horse"],
            &["engine", "wheels", "gearbox", "car"],
        ]))
    }

    #[tokio::test]
    async fn test_search_empty_index() {
        let r = HybridRetriever::new(
            RetrievalConfig::default(),
            Arc::new(LocalVectorIndex::in_memory(animal_embedder())),
            Arc::new(KeywordIndex::in_memory()),
        );
        assert!(r.search("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_ranks_and_attaches_summary() {
        let r = retriever(animal_embedder(), RetrievalConfig::default()).await;
        let results = r.search("zebra", 5).await.unwrap();

        assert_eq!(results[0].source_path, PathBuf::from("/d/zoo.txt"));
        assert_eq!(results[0].summary.as_deref(), Some("summary"));
        assert!(results[0].keyword_score.is_some());
        assert!(results[0].vector_score.is_some());
        assert!(results.len() <= 5);
    }

    #[tokio::test]
    async fn test_search_degrades_to_keyword_only() {
        let embedder = animal_embedder();
        let r = retriever(embedder.clone(), RetrievalConfig::default()).await;
        embedder.set_failing(true);

        let results = r.search("gearbox", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_path, PathBuf::from("/d/cars.txt"));
        assert!(results[0].vector_score.is_none());
        assert!((results[0].score - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_min_score_floor() {
        let config = RetrievalConfig {
            min_score: Some(0.5),
            ..Default::default()
        };
        let r = retriever(animal_embedder(), config).await;
        let results = r.search("zebra", 5).await.unwrap();
        assert!(results.iter().all(|r| r.score >= 0.5));
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_search_k_zero() {
        let r = retriever(animal_embedder(), RetrievalConfig::default()).await;
        assert!(r.search("zebra", 0).await.unwrap().is_empty());
    }
}
