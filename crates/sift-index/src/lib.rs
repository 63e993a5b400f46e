//! Incremental file indexing and hybrid retrieval for sift.
//!
//! This crate provides:
//! - A content fingerprint store that turns restarts into O(changed files)
//! - Fixed-size overlapping character chunking
//! - A local vector index and a BM25 keyword index behind one contract
//! - An index coordinator with per-path serialization and a bounded worker pool
//! - Background file watching for live updates
//! - Hybrid search fusing vector and keyword rankings

pub mod chunker;
pub mod coordinator;
pub mod embeddings;
pub mod engine;
pub mod extract;
pub mod fingerprint;
pub mod index;
pub mod search;
pub mod summarize;
pub mod walk;
pub mod watcher;

mod persist;

#[cfg(test)]
mod testing;

// Re-exports
pub use chunker::{chunk, Chunk, ChunkKey, Chunker, ChunkerError};
pub use coordinator::{
    CoordinatorConfig, IndexCoordinator, IndexStats, ReconcileReport, SyncOutcome, UpsertOutcome,
};
pub use embeddings::{EmbeddingProvider, OpenAiCompatEmbeddings};
pub use engine::{Engine, EngineConfig, EngineError, FolderReport};
pub use extract::{ExtractionError, Extractor, TextExtractor};
pub use fingerprint::{FileRecord, FingerprintStore, IndexMode, IndexState};
pub use index::{ChunkHit, ChunkIndex, ChunkMetadata, KeywordIndex, LocalVectorIndex, StoreError};
pub use search::{HybridRetriever, RetrievalConfig, ScoredResult, SearchError};
pub use summarize::{ChatSummarizer, Summarizer};
pub use walk::WalkPolicy;
pub use watcher::{FileEvent, FileWatcher, IndexQueue, PauseGate, WatcherConfig, WatcherError};
