//! Disk-backed vector index with brute-force cosine similarity.
//!
//! Entries live in memory behind an `Arc` snapshot. Mutations edit the
//! snapshot in place (copying it only while a reader still holds it) and
//! mark the index dirty; [`ChunkIndex::flush`] writes the whole file.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{ChunkHit, ChunkIndex, ChunkMetadata, StoreError};
use crate::chunker::{Chunk, ChunkKey};
use crate::embeddings::EmbeddingProvider;
use crate::persist::atomic_write;

const VECTOR_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorEntry {
    id: String,
    metadata: ChunkMetadata,
    text: String,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct VectorFileRef<'a> {
    version: u32,
    model: &'a str,
    dimensions: usize,
    entries: &'a [Arc<VectorEntry>],
}

#[derive(Deserialize)]
struct VectorFile {
    version: u32,
    model: String,
    dimensions: usize,
    entries: Vec<VectorEntry>,
}

type Snapshot = Arc<Vec<Arc<VectorEntry>>>;

/// Vector index persisted to a local JSON file.
pub struct LocalVectorIndex {
    path: Option<PathBuf>,
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<Snapshot>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
}

impl LocalVectorIndex {
    /// Open the index at `path`, creating an empty one if the file is absent.
    ///
    /// A file written with a different embedding model or dimension count
    /// is reported as corrupt, since its vectors are not comparable.
    pub fn open(
        path: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: VectorFile =
                    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                if file.version != VECTOR_FORMAT_VERSION
                    || file.model != embedder.model_name()
                    || file.dimensions != embedder.dimensions()
                {
                    return Err(StoreError::Corrupt {
                        path,
                        reason: format!(
                            "built with {} ({} dims, v{}), configured {} ({} dims)",
                            file.model,
                            file.dimensions,
                            file.version,
                            embedder.model_name(),
                            embedder.dimensions()
                        ),
                    });
                }
                file.entries.into_iter().map(Arc::new).collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(StoreError::Corrupt {
                    path,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        info!("Opened vector index {:?} with {} entries", path, entries.len());
        Ok(Self {
            path: Some(path),
            embedder,
            entries: RwLock::new(Arc::new(entries)),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        })
    }

    /// An index that is never written to disk.
    pub fn in_memory(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            path: None,
            embedder,
            entries: RwLock::new(Arc::new(Vec::new())),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    async fn snapshot(&self) -> Snapshot {
        self.entries.read().await.clone()
    }

    /// Embed chunk texts in provider-sized batches.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, StoreError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batch_size = self.embedder.max_batch_size().max(1);
        let dimensions = self.embedder.dimensions();

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            let embedded = self
                .embedder
                .embed_batch(batch)
                .await
                .map_err(|e| StoreError::Embedding(e.to_string()))?;
            if embedded.len() != batch.len() {
                return Err(StoreError::Embedding(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    embedded.len()
                )));
            }
            if let Some(bad) = embedded.iter().find(|v| v.len() != dimensions) {
                return Err(StoreError::Embedding(format!(
                    "expected {} dimensions, got {}",
                    dimensions,
                    bad.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    fn build_entries(
        chunks: &[Chunk],
        vectors: Vec<Vec<f32>>,
        summary: Option<&str>,
    ) -> Vec<Arc<VectorEntry>> {
        chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, embedding)| {
                Arc::new(VectorEntry {
                    id: chunk.key().id(),
                    metadata: ChunkMetadata::for_chunk(chunk, summary),
                    text: chunk.text.clone(),
                    embedding,
                })
            })
            .collect()
    }

    /// Drop entries whose path is in `remove`, then append `extra`.
    async fn apply(&self, remove: &HashSet<&Path>, extra: Vec<Arc<VectorEntry>>) {
        let mut entries = self.entries.write().await;
        let removed = entries
            .iter()
            .filter(|e| remove.contains(e.metadata.path.as_path()))
            .count();
        if removed == 0 && extra.is_empty() {
            return;
        }

        let next = Arc::make_mut(&mut *entries);
        if removed > 0 {
            next.retain(|e| !remove.contains(e.metadata.path.as_path()));
        }
        let added = extra.len();
        next.extend(extra);
        self.dirty.store(true, Ordering::Release);

        debug!("Vector index: removed {} entries, added {}", removed, added);
    }

    /// Serializer for `spawn_blocking`.
    fn write_file(
        &self,
        path: PathBuf,
        entries: Snapshot,
    ) -> impl FnOnce() -> Result<(), StoreError> + Send + 'static {
        let model = self.embedder.model_name().to_string();
        let dimensions = self.embedder.dimensions();
        move || {
            let file = VectorFileRef {
                version: VECTOR_FORMAT_VERSION,
                model: &model,
                dimensions,
                entries: &entries,
            };
            let bytes = serde_json::to_vec(&file).map_err(StoreError::Serialize)?;
            atomic_write(&path, &bytes)?;
            Ok(())
        }
    }
}

/// Cosine similarity; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl ChunkIndex for LocalVectorIndex {
    fn name(&self) -> &'static str {
        "vector"
    }

    async fn add(&self, chunks: &[Chunk], summary: Option<&str>) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let vectors = self.embed_chunks(chunks).await?;
        let extra = Self::build_entries(chunks, vectors, summary);
        self.apply(&HashSet::new(), extra).await;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        self.apply(&HashSet::from([path]), Vec::new()).await;
        Ok(())
    }

    async fn delete_many(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        let remove: HashSet<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.apply(&remove, Vec::new()).await;
        Ok(())
    }

    async fn replace(
        &self,
        path: &Path,
        chunks: &[Chunk],
        summary: Option<&str>,
    ) -> Result<(), StoreError> {
        // Embed before touching the store so a failure leaves the old entries.
        let vectors = self.embed_chunks(chunks).await?;
        let extra = Self::build_entries(chunks, vectors, summary);
        self.apply(&HashSet::from([path]), extra).await;
        Ok(())
    }

    async fn set_summary(&self, path: &Path, summary: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        if !entries.iter().any(|e| e.metadata.path == path) {
            return Ok(0);
        }
        let mut updated = 0;
        for entry in Arc::make_mut(&mut *entries)
            .iter_mut()
            .filter(|e| e.metadata.path == path)
        {
            Arc::make_mut(entry).metadata.summary = Some(summary.to_string());
            updated += 1;
        }
        self.dirty.store(true, Ordering::Release);
        Ok(updated)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().await;
        let snapshot = {
            // Writers set `dirty` under the write lock, so clearing it under
            // the read lock never loses a mutation.
            let entries = self.entries.read().await;
            if !self.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            entries.clone()
        };

        let count = snapshot.len();
        let written = tokio::task::spawn_blocking(self.write_file(path.clone(), snapshot))
            .await
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))
            .and_then(|r| r);
        if let Err(e) = written {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!("Flushed {} vector entries to {:?}", count, path);
        Ok(())
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<ChunkHit>, StoreError> {
        let snapshot = self.snapshot().await;
        if snapshot.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| StoreError::Embedding(e.to_string()))?;

        let mut scored: Vec<(f32, &Arc<VectorEntry>)> = snapshot
            .iter()
            .map(|e| (cosine_similarity(&query, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.metadata.path.cmp(&b.1.metadata.path))
                .then_with(|| a.1.metadata.sequence_index.cmp(&b.1.metadata.sequence_index))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, e)| ChunkHit {
                key: ChunkKey::new(e.metadata.path.clone(), e.metadata.sequence_index),
                text: e.text.clone(),
                score,
                summary: e.metadata.summary.clone(),
            })
            .collect())
    }

    async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn paths(&self) -> HashSet<PathBuf> {
        self.snapshot()
            .await
            .iter()
            .map(|e| e.metadata.path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::testing::AxisEmbedder;
    use tempfile::tempdir;

    fn embedder() -> Arc<AxisEmbedder> {
        Arc::new(AxisEmbedder::new(&[&["rust", "cargo"], &["python", "pip"]]))
    }

    fn chunks(path: &str, text: &str) -> Vec<Chunk> {
        Chunker::new(20, 5).unwrap().chunk(Path::new(path), text)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_add_query_delete() {
        let index = LocalVectorIndex::in_memory(embedder());
        index
            .add(&chunks("/d/r.txt", "rust cargo"), Some("about rust"))
            .await
            .unwrap();
        index.add(&chunks("/d/p.txt", "python pip"), None).await.unwrap();
        assert_eq!(index.count().await, 2);

        let hits = index.query("cargo build", 5).await.unwrap();
        assert_eq!(hits[0].key.path, PathBuf::from("/d/r.txt"));
        assert_eq!(hits[0].summary.as_deref(), Some("about rust"));
        assert!(hits[0].score > hits[1].score);

        index.delete(Path::new("/d/r.txt")).await.unwrap();
        assert_eq!(index.count().await, 1);
        index.delete(Path::new("/d/r.txt")).await.unwrap();
        assert_eq!(index.count().await, 1);
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let index = LocalVectorIndex::in_memory(embedder());
        let c = chunks("/d/r.txt", &"rust cargo ".repeat(10));

        index.replace(Path::new("/d/r.txt"), &c, None).await.unwrap();
        let first = index.count().await;
        index.replace(Path::new("/d/r.txt"), &c, None).await.unwrap();

        assert_eq!(index.count().await, first);
        assert_eq!(first, c.len());
    }

    #[tokio::test]
    async fn test_replace_keeps_old_entries_when_embedding_fails() {
        let embedder = embedder();
        let index = LocalVectorIndex::in_memory(embedder.clone());
        index.add(&chunks("/d/r.txt", "rust"), None).await.unwrap();

        embedder.set_failing(true);
        let result = index
            .replace(Path::new("/d/r.txt"), &chunks("/d/r.txt", "python"), None)
            .await;

        assert!(matches!(result, Err(StoreError::Embedding(_))));
        assert_eq!(index.count().await, 1);
        assert!(index.paths().await.contains(Path::new("/d/r.txt")));
    }

    #[tokio::test]
    async fn test_empty_query_skips_embedding() {
        let embedder = embedder();
        embedder.set_failing(true);
        let index = LocalVectorIndex::in_memory(embedder);
        assert!(index.query("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.json");

        {
            let index = LocalVectorIndex::open(&path, embedder()).unwrap();
            index.add(&chunks("/d/r.txt", "rust"), None).await.unwrap();
            index.add(&chunks("/d/p.txt", "python"), None).await.unwrap();
            index.delete_many(&[PathBuf::from("/d/p.txt")]).await.unwrap();
            index.flush().await.unwrap();
        }

        let reopened = LocalVectorIndex::open(&path, embedder()).unwrap();
        assert_eq!(reopened.count().await, 1);
        assert_eq!(
            reopened.paths().await,
            HashSet::from([PathBuf::from("/d/r.txt")])
        );
    }

    #[tokio::test]
    async fn test_open_rejects_other_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        {
            let index = LocalVectorIndex::open(&path, embedder()).unwrap();
            index.add(&chunks("/d/r.txt", "rust"), None).await.unwrap();
            index.flush().await.unwrap();
        }

        let other = Arc::new(AxisEmbedder::new(&[&["rust"]]));
        let result = LocalVectorIndex::open(&path, other);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_mutations_reach_disk_only_on_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let index = LocalVectorIndex::open(&path, embedder()).unwrap();

        index.add(&chunks("/d/r.txt", "rust"), None).await.unwrap();
        index.add(&chunks("/d/p.txt", "python"), None).await.unwrap();
        assert!(!path.exists());
        assert_eq!(index.count().await, 2);

        index.flush().await.unwrap();
        let written = std::fs::metadata(&path).unwrap().modified().unwrap();
        // Nothing changed since the last flush.
        index.flush().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), written);
        assert_eq!(LocalVectorIndex::open(&path, embedder()).unwrap().count().await, 2);
    }

    #[tokio::test]
    async fn test_set_summary_updates_every_chunk() {
        let index = LocalVectorIndex::in_memory(embedder());
        let c = chunks("/d/r.txt", &"rust cargo ".repeat(10));
        index.add(&c, None).await.unwrap();
        index.add(&chunks("/d/p.txt", "python"), None).await.unwrap();

        let updated = index.set_summary(Path::new("/d/r.txt"), "crates").await.unwrap();
        assert_eq!(updated, c.len());
        let hits = index.query("cargo", 50).await.unwrap();
        for hit in hits.iter().filter(|h| h.key.path == Path::new("/d/r.txt")) {
            assert_eq!(hit.summary.as_deref(), Some("crates"));
        }
        assert_eq!(index.set_summary(Path::new("/d/none.txt"), "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        std::fs::write(&path, "not json").unwrap();

        let result = LocalVectorIndex::open(&path, embedder());
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
