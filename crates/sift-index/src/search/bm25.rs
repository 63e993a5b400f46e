//! BM25 keyword ranking over a positional corpus.
//!
//! Documents are addressed by their position in `corpus`; `metadata[i]`
//! describes `corpus[i]`. The two arrays only ever change together, which
//! is why removal rebuilds a fresh corpus instead of deleting in place.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::index::ChunkMetadata;

/// BM25 parameters
const K1: f64 = 1.2; // Term frequency saturation
const B: f64 = 0.75; // Length normalization

/// A tokenized document.
#[derive(Debug, Clone)]
pub struct Document {
    pub text: String,
    term_freqs: HashMap<String, u32>,
    length: usize,
}

impl Document {
    pub fn new(text: String) -> Self {
        let tokens = tokenize(&text);
        let length = tokens.len();
        let mut term_freqs = HashMap::new();
        for token in tokens {
            *term_freqs.entry(token).or_insert(0) += 1;
        }
        Self {
            text,
            term_freqs,
            length,
        }
    }
}

/// Tokenize text into terms
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.chars().count() > 1)
        .map(String::from)
        .collect()
}

/// BM25 corpus with aligned per-document metadata.
#[derive(Debug, Clone, Default)]
pub struct Bm25Corpus {
    corpus: Vec<Arc<Document>>,
    metadata: Vec<ChunkMetadata>,
    doc_freq: HashMap<String, usize>,
    total_length: usize,
}

impl Bm25Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a corpus from aligned text and metadata.
    pub fn from_parts(texts: Vec<String>, metadata: Vec<ChunkMetadata>) -> Self {
        let mut corpus = Self::new();
        for (text, meta) in texts.into_iter().zip(metadata) {
            corpus.push_document(Arc::new(Document::new(text)), meta);
        }
        corpus
    }

    /// Append a document and its metadata.
    pub fn push(&mut self, text: String, metadata: ChunkMetadata) {
        self.push_document(Arc::new(Document::new(text)), metadata);
    }

    fn push_document(&mut self, doc: Arc<Document>, metadata: ChunkMetadata) {
        for term in doc.term_freqs.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += doc.length;
        self.corpus.push(doc);
        self.metadata.push(metadata);
    }

    /// A new corpus holding only the documents whose metadata passes `keep`.
    pub fn rebuild<F>(&self, keep: F) -> Self
    where
        F: Fn(&ChunkMetadata) -> bool,
    {
        let mut next = Self::new();
        for (doc, meta) in self.corpus.iter().zip(&self.metadata) {
            if keep(meta) {
                next.push_document(doc.clone(), meta.clone());
            }
        }
        next
    }

    /// Set the summary on every document of `path`. Term statistics are
    /// unaffected. Returns how many documents changed.
    pub fn set_summary(&mut self, path: &Path, summary: &str) -> usize {
        let mut updated = 0;
        for meta in self.metadata.iter_mut().filter(|m| m.path == path) {
            meta.summary = Some(summary.to_string());
            updated += 1;
        }
        updated
    }

    /// Calculate IDF for a term
    fn idf(&self, term: &str) -> f64 {
        let doc_freq = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        if doc_freq == 0.0 {
            return 0.0;
        }
        let n = self.corpus.len() as f64;
        ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln()
    }

    fn avg_doc_length(&self) -> f64 {
        if self.corpus.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.corpus.len() as f64
        }
    }

    /// Calculate BM25 score for a document given a query
    fn score_document(&self, doc: &Document, query_terms: &[(String, f64)], avg_len: f64) -> f64 {
        let doc_length = doc.length as f64;
        let mut score = 0.0;

        for (term, idf) in query_terms {
            let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
            if tf > 0.0 {
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc_length / avg_len));
                score += idf * (numerator / denominator);
            }
        }

        score
    }

    /// Rank documents against `query`, returning `(position, score)` pairs
    /// with positive scores, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(usize, f64)> {
        let unique: BTreeSet<String> = tokenize(query).into_iter().collect();
        if unique.is_empty() || self.corpus.is_empty() {
            return Vec::new();
        }
        let query_terms: Vec<(String, f64)> = unique
            .into_iter()
            .map(|t| {
                let idf = self.idf(&t);
                (t, idf)
            })
            .filter(|(_, idf)| *idf > 0.0)
            .collect();
        let avg_len = self.avg_doc_length();

        let mut scores: Vec<(usize, f64)> = self
            .corpus
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, self.score_document(doc, &query_terms, avg_len)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| {
            let (ma, mb) = (&self.metadata[a.0], &self.metadata[b.0]);
            b.1.total_cmp(&a.1)
                .then_with(|| (&ma.path, ma.sequence_index).cmp(&(&mb.path, mb.sequence_index)))
        });
        scores.truncate(limit);
        scores
    }

    pub fn text(&self, position: usize) -> Option<&str> {
        self.corpus.get(position).map(|d| d.text.as_str())
    }

    pub fn metadata(&self, position: usize) -> Option<&ChunkMetadata> {
        self.metadata.get(position)
    }

    /// All metadata, aligned with the corpus.
    pub fn all_metadata(&self) -> &[ChunkMetadata] {
        &self.metadata
    }

    /// All document texts, aligned with the metadata.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.corpus.iter().map(|d| d.text.as_str())
    }

    /// Get the number of documents in the corpus
    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    /// Check if the corpus is empty
    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn meta(path: &str, seq: usize) -> ChunkMetadata {
        ChunkMetadata {
            path: PathBuf::from(path),
            sequence_index: seq,
            summary: None,
        }
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Hello, World! This is a test_function.");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
        assert!(tokens.contains(&"test_function".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_add_and_search() {
        let mut corpus = Bm25Corpus::new();
        corpus.push("The quick brown fox".to_string(), meta("/1", 0));
        corpus.push("The lazy dog".to_string(), meta("/2", 0));
        corpus.push("The quick rabbit".to_string(), meta("/3", 0));

        let results = corpus.search("quick fox", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(corpus.metadata(results[0].0).unwrap().path, PathBuf::from("/1"));
    }

    #[test]
    fn test_no_match_returns_empty() {
        let mut corpus = Bm25Corpus::new();
        corpus.push("alpha beta".to_string(), meta("/1", 0));
        assert!(corpus.search("gamma", 10).is_empty());
        assert!(corpus.search("", 10).is_empty());
        assert!(Bm25Corpus::new().search("alpha", 10).is_empty());
    }

    #[test]
    fn test_rebuild_keeps_alignment() {
        let mut corpus = Bm25Corpus::new();
        corpus.push("keep one".to_string(), meta("/keep", 0));
        corpus.push("drop one".to_string(), meta("/drop", 0));
        corpus.push("keep two".to_string(), meta("/keep", 1));
        corpus.push("drop two".to_string(), meta("/drop", 1));

        let rebuilt = corpus.rebuild(|m| m.path != PathBuf::from("/drop"));
        assert_eq!(rebuilt.len(), 2);
        for i in 0..rebuilt.len() {
            let text = rebuilt.text(i).unwrap();
            let m = rebuilt.metadata(i).unwrap();
            assert_eq!(m.path, PathBuf::from("/keep"));
            assert!(text.starts_with("keep"));
        }
        assert!(rebuilt.search("drop", 10).is_empty());
        assert_eq!(corpus.len(), 4);
    }

    #[test]
    fn test_rebuild_matches_fresh_build() {
        let mut corpus = Bm25Corpus::new();
        corpus.push("rust async runtime".to_string(), meta("/a", 0));
        corpus.push("python asyncio loop".to_string(), meta("/b", 0));
        corpus.push("rust tokio runtime".to_string(), meta("/c", 0));

        let rebuilt = corpus.rebuild(|m| m.path != PathBuf::from("/b"));
        let fresh = Bm25Corpus::from_parts(
            vec!["rust async runtime".to_string(), "rust tokio runtime".to_string()],
            vec![meta("/a", 0), meta("/c", 0)],
        );
        assert_eq!(rebuilt.search("tokio runtime", 5), fresh.search("tokio runtime", 5));
    }

    #[test]
    fn test_ties_break_by_path_then_sequence() {
        let mut corpus = Bm25Corpus::new();
        corpus.push("same words".to_string(), meta("/b", 0));
        corpus.push("same words".to_string(), meta("/a", 1));
        corpus.push("same words".to_string(), meta("/a", 0));

        let order: Vec<(PathBuf, usize)> = corpus
            .search("same", 10)
            .into_iter()
            .map(|(i, _)| {
                let m = corpus.metadata(i).unwrap();
                (m.path.clone(), m.sequence_index)
            })
            .collect();
        assert_eq!(
            order,
            vec![
                (PathBuf::from("/a"), 0),
                (PathBuf::from("/a"), 1),
                (PathBuf::from("/b"), 0)
            ]
        );
    }

    #[test]
    fn test_exact_identifier_ranks_first() {
        let mut corpus = Bm25Corpus::new();
        corpus.push("fn calculate_total(items: &[Item]) -> f64".to_string(), meta("/1", 0));
        corpus.push("struct Item { name: String, price: f64 }".to_string(), meta("/2", 0));
        corpus.push("fn process_order(order: Order) -> Receipt".to_string(), meta("/3", 0));

        let results = corpus.search("calculate_total", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(corpus.metadata(results[0].0).unwrap().path, PathBuf::from("/1"));
    }
}
