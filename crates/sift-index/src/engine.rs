//! Engine facade.
//!
//! Opens the three persisted stores under one data directory, wires the
//! coordinator and the retriever to them, and owns the watch lifecycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::coordinator::{
    normalize_path, CoordinatorConfig, IndexCoordinator, IndexStats, ReconcileReport,
};
use crate::embeddings::EmbeddingProvider;
use crate::extract::Extractor;
use crate::fingerprint::{FingerprintError, FingerprintStore, IndexMode};
use crate::index::{KeywordIndex, LocalVectorIndex, StoreError};
use crate::persist::quarantine;
use crate::search::{HybridRetriever, RetrievalConfig, ScoredResult, SearchError};
use crate::summarize::Summarizer;
use crate::watcher::{FileWatcher, IndexQueue, PauseGate, WatcherConfig};

pub const STATE_FILE: &str = "index_state.json";
pub const VECTOR_FILE: &str = "vectors.json";
pub const KEYWORD_FILE: &str = "keyword.json";

/// Watch lifecycle misuse.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    #[error("Watching requires a completed reconcile")]
    NotReconciled,

    #[error("Already watching")]
    AlreadyWatching,

    #[error("Not watching")]
    NotWatching,
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the fingerprint, vector and keyword stores
    pub data_dir: PathBuf,
    pub coordinator: CoordinatorConfig,
    pub retrieval: RetrievalConfig,
    pub watcher: WatcherConfig,
    /// Quarantine unreadable stores and reindex instead of failing
    pub rebuild_on_corrupt: bool,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            coordinator: CoordinatorConfig::default(),
            retrieval: RetrievalConfig::default(),
            watcher: WatcherConfig::default(),
            rebuild_on_corrupt: true,
        }
    }
}

/// Result of adding one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderReport {
    pub indexed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl From<&ReconcileReport> for FolderReport {
    fn from(report: &ReconcileReport) -> Self {
        Self {
            indexed: report.indexed,
            skipped: report.skipped,
            errors: report.errors,
        }
    }
}

struct WatchSession {
    watcher: FileWatcher,
    queue: JoinHandle<()>,
}

/// The indexing engine and hybrid retrieval core behind one handle.
pub struct Engine {
    config: EngineConfig,
    coordinator: Arc<IndexCoordinator>,
    retriever: HybridRetriever,
    reconciled: AtomicBool,
    session: Mutex<Option<WatchSession>>,
    /// Held for writing to keep the index queue idle
    pause: PauseGate,
}

impl Engine {
    /// Open (or create) the stores under `config.data_dir`.
    ///
    /// A corrupt store is moved aside and rebuilt when
    /// `rebuild_on_corrupt` is set; the next reconcile then reindexes
    /// everything. Otherwise the error is returned.
    pub fn open(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn Extractor>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Result<Self> {
        let data_dir = &config.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        let rebuild = config.rebuild_on_corrupt;
        let mut recovered = false;

        let vector = open_store(&data_dir.join(VECTOR_FILE), rebuild, &mut recovered, |p| {
            LocalVectorIndex::open(p, embedder.clone())
        })?;
        let keyword = open_store(&data_dir.join(KEYWORD_FILE), rebuild, &mut recovered, |p| {
            KeywordIndex::open(p)
        })?;

        let state_path = data_dir.join(STATE_FILE);
        let mut fingerprints = match FingerprintStore::open(&state_path) {
            Ok(store) => store,
            Err(FingerprintError::Parse(e)) if rebuild => {
                warn!("{:?} is unreadable ({}), starting over", state_path, e);
                quarantine(&state_path)
                    .with_context(|| format!("Failed to move aside {}", state_path.display()))?;
                recovered = true;
                FingerprintStore::open(&state_path)?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open {}", state_path.display()))
            }
        };
        if recovered {
            info!("Recovered from a corrupt store, the next reconcile reindexes everything");
            fingerprints.state_mut().reset_mode();
        }

        let vector = Arc::new(vector);
        let keyword = Arc::new(keyword);
        let coordinator = IndexCoordinator::new(
            config.coordinator.clone(),
            extractor,
            summarizer,
            vector.clone(),
            keyword.clone(),
            fingerprints,
        )
        .context("Invalid chunking configuration")?;
        let retriever = HybridRetriever::new(config.retrieval.clone(), vector, keyword);

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
            retriever,
            reconciled: AtomicBool::new(false),
            session: Mutex::new(None),
            pause: PauseGate::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }

    /// Reconcile `roots`, or every previously reconciled root if empty.
    ///
    /// Refused while watching: the watcher and a full reconcile must not
    /// claim the same files at the same time.
    pub async fn reconcile(&self, roots: &[PathBuf]) -> Result<ReconcileReport> {
        if self.is_watching().await {
            return Err(EngineError::AlreadyWatching.into());
        }
        let roots = if roots.is_empty() {
            self.coordinator.roots().await
        } else {
            roots.to_vec()
        };
        let report = self.coordinator.reconcile(&roots).await?;
        self.reconciled.store(true, Ordering::SeqCst);
        Ok(report)
    }

    /// Index a new root. While watching, the root joins the live watcher
    /// once its initial reconcile completes.
    ///
    /// Watcher-driven updates are held back until then, so none of them
    /// interleaves with the reconcile's removal pass.
    pub async fn add_folder(&self, path: &Path) -> Result<FolderReport> {
        let root = normalize_path(path);
        if !root.exists() {
            anyhow::bail!("{} does not exist", root.display());
        }
        let _paused = self.pause.write().await;
        let report = self.coordinator.reconcile(std::slice::from_ref(&root)).await?;

        let mut session = self.session.lock().await;
        if let Some(session) = session.as_mut() {
            session.watcher.add_root(&root)?;
        }
        info!("Added folder {:?}: {:?}", root, report);
        Ok(FolderReport::from(&report))
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredResult>, SearchError> {
        self.retriever.search(query, k).await
    }

    pub async fn ask_context(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredResult>, SearchError> {
        self.retriever.ask_context(query, k).await
    }

    /// Other indexed files with the same content as `path`.
    pub async fn duplicates_of(&self, path: &Path) -> Vec<PathBuf> {
        self.coordinator.duplicates_of(path).await
    }

    pub async fn stats(&self) -> IndexStats {
        self.coordinator.stats().await
    }

    pub async fn roots(&self) -> Vec<PathBuf> {
        self.coordinator.roots().await
    }

    pub async fn mode(&self) -> IndexMode {
        self.coordinator.mode().await
    }

    /// Reconcile, then start watching every reconciled root.
    pub async fn watch(&self, roots: &[PathBuf]) -> Result<ReconcileReport> {
        let report = self.reconcile(roots).await?;
        self.start_watching().await?;
        Ok(report)
    }

    /// Start the watcher over every reconciled root.
    pub async fn start_watching(&self) -> Result<()> {
        if !self.reconciled.load(Ordering::SeqCst) {
            return Err(EngineError::NotReconciled.into());
        }
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(EngineError::AlreadyWatching.into());
        }

        let roots = self.coordinator.roots().await;
        let mut watcher = FileWatcher::new(
            self.config.watcher.clone(),
            self.coordinator.walk_policy().clone(),
        );
        let events = watcher.start(&roots)?;
        let queue = IndexQueue::new(self.coordinator.clone()).with_pause(self.pause.clone());
        let queue = tokio::spawn(queue.run(events));

        *session = Some(WatchSession { watcher, queue });
        Ok(())
    }

    /// Stop the watcher and wait for queued events to be applied.
    pub async fn stop_watching(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(EngineError::NotWatching.into());
        };
        session.watcher.stop();
        drop(session.watcher);
        if let Err(e) = session.queue.await {
            error!("Index queue task failed: {}", e);
        }
        self.coordinator.persist().await
    }

    pub async fn is_watching(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

/// Open a store, quarantining and recreating it if it is corrupt and
/// `rebuild` is set.
fn open_store<T>(
    path: &Path,
    rebuild: bool,
    recovered: &mut bool,
    open: impl Fn(&Path) -> Result<T, StoreError>,
) -> Result<T> {
    match open(path) {
        Ok(store) => Ok(store),
        Err(StoreError::Corrupt { reason, .. }) if rebuild => {
            warn!("{:?} is unreadable ({}), rebuilding it", path, reason);
            let moved = quarantine(path)
                .with_context(|| format!("Failed to move aside {}", path.display()))?;
            info!("Moved corrupt store to {:?}", moved);
            *recovered = true;
            open(path).with_context(|| format!("Failed to recreate {}", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to open {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AxisEmbedder, PdfFailsExtractor};
    use tempfile::tempdir;

    fn open(data_dir: &Path) -> Result<Engine> {
        Engine::open(
            EngineConfig::new(data_dir),
            Arc::new(AxisEmbedder::new(&[&["invoice"]])),
            Arc::new(PdfFailsExtractor),
            None,
        )
    }

    #[tokio::test]
    async fn test_open_creates_data_dir() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("nested").join("data");
        let engine = open(&data).unwrap();

        assert!(data.is_dir());
        assert_eq!(engine.mode().await, IndexMode::FirstRun);
        assert_eq!(engine.stats().await, IndexStats::default());
    }

    #[tokio::test]
    async fn test_start_watching_requires_reconcile() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path()).unwrap();

        let err = engine.start_watching().await.unwrap_err();
        assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::NotReconciled));
        let err = engine.stop_watching().await.unwrap_err();
        assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::NotWatching));
    }

    #[tokio::test]
    async fn test_watch_lifecycle() {
        let dir = tempdir().unwrap();
        let docs = tempdir().unwrap();
        std::fs::write(docs.path().join("a.txt"), "invoice").unwrap();
        let engine = open(dir.path()).unwrap();

        let report = engine.watch(&[docs.path().to_path_buf()]).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert!(engine.is_watching().await);

        let err = engine.reconcile(&[]).await.unwrap_err();
        assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::AlreadyWatching));

        engine.stop_watching().await.unwrap();
        assert!(!engine.is_watching().await);
    }

    #[tokio::test]
    async fn test_add_folder_while_watching() {
        let dir = tempdir().unwrap();
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        std::fs::write(first.path().join("a.txt"), "invoice").unwrap();
        std::fs::write(second.path().join("b.txt"), "invoice again").unwrap();
        let engine = open(dir.path()).unwrap();
        engine.watch(&[first.path().to_path_buf()]).await.unwrap();

        let report = engine.add_folder(second.path()).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(engine.roots().await.len(), 2);
        assert_eq!(engine.stats().await.tracked_file_count, 2);

        // The pause is released once the folder is added.
        assert!(engine.pause.try_write().is_ok());
        engine.stop_watching().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicates_of_identical_files() {
        let dir = tempdir().unwrap();
        let docs = tempdir().unwrap();
        let a = docs.path().join("a.txt");
        let b = docs.path().join("b.txt");
        std::fs::write(&a, "invoice copy").unwrap();
        std::fs::write(&b, "invoice copy").unwrap();
        std::fs::write(docs.path().join("c.txt"), "invoice original").unwrap();
        let engine = open(dir.path()).unwrap();
        engine.reconcile(&[docs.path().to_path_buf()]).await.unwrap();

        assert_eq!(engine.duplicates_of(&a).await, vec![normalize_path(&b)]);
        assert_eq!(engine.duplicates_of(&b).await, vec![normalize_path(&a)]);
        assert!(engine.duplicates_of(&docs.path().join("c.txt")).await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_keyword_store_is_rebuilt() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(KEYWORD_FILE), "garbage").unwrap();

        let engine = open(dir.path()).unwrap();
        assert_eq!(engine.mode().await, IndexMode::FirstRun);
        assert!(dir.path().join("keyword.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_corrupt_store_propagates_without_rebuild() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{").unwrap();

        let mut config = EngineConfig::new(dir.path());
        config.rebuild_on_corrupt = false;
        let result = Engine::open(
            config,
            Arc::new(AxisEmbedder::new(&[&["invoice"]])),
            Arc::new(PdfFailsExtractor),
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_folder_missing_path() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path()).unwrap();
        assert!(engine.add_folder(&dir.path().join("nope")).await.is_err());
    }
}
