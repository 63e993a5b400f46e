//! Chunk stores behind one symmetric adapter contract.
//!
//! The coordinator writes to and the retriever reads from a vector index
//! and a keyword index through [`ChunkIndex`]. Each adapter owns its
//! on-disk format. Mutations are visible to queries as soon as they
//! return but only reach disk on [`ChunkIndex::flush`].

pub mod keyword;
pub mod vector;

pub use keyword::KeywordIndex;
pub use vector::LocalVectorIndex;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunker::{Chunk, ChunkKey};

/// Errors raised by the chunk stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to serialize store: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Embedding failed: {0}")]
    Embedding(String),
}

/// What a store records alongside each chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub path: PathBuf,
    pub sequence_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ChunkMetadata {
    pub fn for_chunk(chunk: &Chunk, summary: Option<&str>) -> Self {
        Self {
            path: chunk.source_path.clone(),
            sequence_index: chunk.sequence_index,
            summary: summary.map(str::to_string),
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.path.clone(), self.sequence_index)
    }
}

/// A scored chunk returned by a store query.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub key: ChunkKey,
    pub text: String,
    /// Similarity (vector) or relevance (keyword); higher is better
    pub score: f32,
    pub summary: Option<String>,
}

/// Contract shared by the vector and keyword stores.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Append chunks; callers remove a path's old chunks first.
    async fn add(&self, chunks: &[Chunk], summary: Option<&str>) -> Result<(), StoreError>;

    /// Remove every chunk of `path`. Absent paths are a no-op.
    async fn delete(&self, path: &Path) -> Result<(), StoreError>;

    /// Remove every chunk of every path in `paths`.
    async fn delete_many(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        for path in paths {
            self.delete(path).await?;
        }
        Ok(())
    }

    /// Remove-then-insert for one path. Stores override this to make the
    /// swap a single step.
    async fn replace(
        &self,
        path: &Path,
        chunks: &[Chunk],
        summary: Option<&str>,
    ) -> Result<(), StoreError> {
        self.delete(path).await?;
        self.add(chunks, summary).await
    }

    /// Set the summary on every chunk of `path`. Returns how many chunks
    /// were updated.
    async fn set_summary(&self, path: &Path, summary: &str) -> Result<usize, StoreError>;

    /// Write buffered mutations to disk. A no-op when nothing changed.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Up to `k` chunks ordered by descending score.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ChunkHit>, StoreError>;

    /// Number of stored chunks.
    async fn count(&self) -> usize;

    /// Distinct paths that have at least one stored chunk.
    async fn paths(&self) -> HashSet<PathBuf>;
}
