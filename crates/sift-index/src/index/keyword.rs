//! Keyword index adapter over a [`Bm25Corpus`].
//!
//! Deletes build a complete new corpus off to the side and publish it
//! with a pointer swap, so queries always see a consistent snapshot even
//! while a delete is rebuilding. Appends edit the live corpus in place.
//! Writers are serialized, and nothing reaches disk until
//! [`ChunkIndex::flush`].

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
use crate::chunker::Chunk;
use crate::persist::atomic_write;
use crate::search::bm25::Bm25Corpus;

const KEYWORD_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct KeywordFileRef<'a> {
    version: u32,
    corpus: Vec<&'a str>,
    metadata: &'a [ChunkMetadata],
}

#[derive(Deserialize)]
struct KeywordFile {
    version: u32,
    corpus: Vec<String>,
    metadata: Vec<ChunkMetadata>,
}

/// BM25 keyword index persisted as aligned `corpus` and `metadata` arrays.
pub struct KeywordIndex {
    path: Option<PathBuf>,
    corpus: RwLock<Arc<Bm25Corpus>>,
    write_lock: Mutex<()>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
}

impl KeywordIndex {
    /// Open the index at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let corpus = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: KeywordFile =
                    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                if file.version != KEYWORD_FORMAT_VERSION {
                    return Err(StoreError::Corrupt {
                        path,
                        reason: format!("unknown format version {}", file.version),
                    });
                }
                if file.corpus.len() != file.metadata.len() {
                    return Err(StoreError::Corrupt {
                        path,
                        reason: format!(
                            "corpus has {} documents but metadata has {} entries",
                            file.corpus.len(),
                            file.metadata.len()
                        ),
                    });
                }
                Bm25Corpus::from_parts(file.corpus, file.metadata)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Bm25Corpus::new(),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(StoreError::Corrupt {
                    path,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        info!("Opened keyword index {:?} with {} documents", path, corpus.len());
        Ok(Self {
            path: Some(path),
            corpus: RwLock::new(Arc::new(corpus)),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        })
    }

    /// An index that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            corpus: RwLock::new(Arc::new(Bm25Corpus::new())),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    async fn snapshot(&self) -> Arc<Bm25Corpus> {
        self.corpus.read().await.clone()
    }

    /// Drop `remove`'s documents, append `chunks`.
    async fn apply(&self, remove: &HashSet<&Path>, chunks: &[Chunk], summary: Option<&str>) {
        let _writer = self.write_lock.lock().await;
        let current = self.snapshot().await;

        let affected = current
            .all_metadata()
            .iter()
            .any(|m| remove.contains(m.path.as_path()));
        if !affected && chunks.is_empty() {
            return;
        }
        let before = current.len();

        let after = if affected {
            let mut next = current.rebuild(|m| !remove.contains(m.path.as_path()));
            drop(current);
            for chunk in chunks {
                next.push(chunk.text.clone(), ChunkMetadata::for_chunk(chunk, summary));
            }
            let after = next.len();
            *self.corpus.write().await = Arc::new(next);
            after
        } else {
            drop(current);
            let mut corpus = self.corpus.write().await;
            let next = Arc::make_mut(&mut *corpus);
            for chunk in chunks {
                next.push(chunk.text.clone(), ChunkMetadata::for_chunk(chunk, summary));
            }
            next.len()
        };
        self.dirty.store(true, Ordering::Release);

        debug!(
            "Keyword index: {} -> {} documents (rebuilt: {})",
            before, after, affected
        );
    }
}

#[async_trait]
impl ChunkIndex for KeywordIndex {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn add(&self, chunks: &[Chunk], summary: Option<&str>) -> Result<(), StoreError> {
        self.apply(&HashSet::new(), chunks, summary).await;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        self.apply(&HashSet::from([path]), &[], None).await;
        Ok(())
    }

    async fn delete_many(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        let remove: HashSet<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.apply(&remove, &[], None).await;
        Ok(())
    }

    async fn replace(
        &self,
        path: &Path,
        chunks: &[Chunk],
        summary: Option<&str>,
    ) -> Result<(), StoreError> {
        self.apply(&HashSet::from([path]), chunks, summary).await;
        Ok(())
    }

    async fn set_summary(&self, path: &Path, summary: &str) -> Result<usize, StoreError> {
        let _writer = self.write_lock.lock().await;
        let mut corpus = self.corpus.write().await;
        if !corpus.all_metadata().iter().any(|m| m.path == path) {
            return Ok(0);
        }
        let updated = Arc::make_mut(&mut *corpus).set_summary(path, summary);
        self.dirty.store(true, Ordering::Release);
        Ok(updated)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().await;
        let corpus = {
            let corpus = self.corpus.read().await;
            if !self.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            corpus.clone()
        };

        let target = path.clone();
        let count = corpus.len();
        let written = tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let file = KeywordFileRef {
                version: KEYWORD_FORMAT_VERSION,
                corpus: corpus.texts().collect(),
                metadata: corpus.all_metadata(),
            };
            let bytes = serde_json::to_vec(&file).map_err(StoreError::Serialize)?;
            atomic_write(&target, &bytes)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))
        .and_then(|r| r);
        if let Err(e) = written {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!("Flushed {} keyword documents to {:?}", count, path);
        Ok(())
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<ChunkHit>, StoreError> {
        let corpus = self.snapshot().await;
        let hits = corpus
            .search(text, k)
            .into_iter()
            .filter_map(|(position, score)| {
                let meta = corpus.metadata(position)?;
                Some(ChunkHit {
                    key: meta.key(),
                    text: corpus.text(position)?.to_string(),
                    score: score as f32,
                    summary: meta.summary.clone(),
                })
            })
            .collect();
        Ok(hits)
    }

    async fn count(&self) -> usize {
        self.corpus.read().await.len()
    }

    async fn paths(&self) -> HashSet<PathBuf> {
        self.snapshot()
            .await
            .all_metadata()
            .iter()
            .map(|m| m.path.clone())
            .collect()
    }
}
