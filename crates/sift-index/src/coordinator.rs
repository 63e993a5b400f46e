//! Index coordinator.
//!
//! Owns the fingerprint store and drives both chunk stores through the
//! file lifecycle: upsert on new or changed content, removal on deletion,
//! and a reconcile pass that brings everything in line with the disk.
//!
//! Work on a single path is serialized by a per-path lock. Work on
//! different paths runs concurrently on a bounded pool of workers.
//!
//! Store mutations are buffered in memory and reach disk together with
//! the fingerprint store in [`IndexCoordinator::persist`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chunker::{Chunker, ChunkerError, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::extract::{ExtractionError, Extractor};
use crate::fingerprint::{hash_file, FileMeta, FileRecord, FingerprintStore, IndexMode};
use crate::index::{ChunkIndex, StoreError};
use crate::summarize::Summarizer;
use crate::walk::WalkPolicy;

/// Default number of files processed concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// Completed files between checkpoints during a reconcile.
const CHECKPOINT_EVERY: usize = 64;

/// Idle per-path locks are pruned once the table grows past this.
const LOCK_TABLE_PRUNE_AT: usize = 4096;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Chunk window size in characters
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks
    pub chunk_overlap: usize,

    /// Maximum number of files processed at once
    pub workers: usize,

    /// Which files a reconcile enumerates
    pub walk: WalkPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            workers: DEFAULT_WORKERS,
            walk: WalkPolicy::default(),
        }
    }
}

/// Counters produced by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Files (re)indexed
    pub indexed: usize,

    /// Files left untouched, plus files with nothing to index
    pub skipped: usize,

    /// Tracked files that no longer exist and were purged
    pub removed: usize,

    /// Files whose extraction or indexing failed
    pub errors: usize,

    /// Store inconsistencies that were fixed
    pub repaired: usize,

    /// Unchanged files whose missing summary was generated this pass
    pub summarized: usize,
}

/// Result of indexing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Both stores now hold `chunks` chunks for the file
    Indexed { chunks: usize },

    /// The file produced no text and holds no entries
    Empty,

    /// Indexing failed; the previous index state is untouched
    Failed(String),
}

/// Result of synchronizing one path with the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Upserted(UpsertOutcome),

    /// Content hash matched the fingerprint
    Unchanged,

    /// The file is gone; `true` if it had been tracked
    Removed(bool),
}

/// Chunk and file counts across the stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub vector_count: usize,
    pub keyword_count: usize,
    pub tracked_file_count: usize,
}

/// Per-path async mutexes.
#[derive(Default)]
struct PathLocks {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > LOCK_TABLE_PRUNE_AT {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// How a reconcile treats one enumerated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    /// Index unconditionally
    Index,
    /// Tracked but missing from a store; index and count as a repair
    Repair,
    /// Compare against the fingerprint first
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Indexed,
    Skipped,
    /// Unchanged, but a missing summary was filled in
    Backfilled,
    Failed,
}

/// Why a path is a removal candidate at the end of a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Tracked, but absent from disk
    Stale,
    /// Present in a store, but untracked
    Orphan,
}

impl From<&UpsertOutcome> for Step {
    fn from(outcome: &UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Indexed { .. } => Step::Indexed,
            UpsertOutcome::Empty => Step::Skipped,
            UpsertOutcome::Failed(_) => Step::Failed,
        }
    }
}

/// Drives the fingerprint store and both chunk stores.
pub struct IndexCoordinator {
    config: CoordinatorConfig,
    chunker: Chunker,
    extractor: Arc<dyn Extractor>,
    summarizer: Option<Arc<dyn Summarizer>>,
    vector: Arc<dyn ChunkIndex>,
    keyword: Arc<dyn ChunkIndex>,
    fingerprints: RwLock<FingerprintStore>,
    save_lock: Mutex<()>,
    locks: PathLocks,
    workers: Arc<Semaphore>,
}

impl IndexCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        extractor: Arc<dyn Extractor>,
        summarizer: Option<Arc<dyn Summarizer>>,
        vector: Arc<dyn ChunkIndex>,
        keyword: Arc<dyn ChunkIndex>,
        fingerprints: FingerprintStore,
    ) -> Result<Self, ChunkerError> {
        let chunker = Chunker::new(config.chunk_size, config.chunk_overlap)?;
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Ok(Self {
            config,
            chunker,
            extractor,
            summarizer,
            vector,
            keyword,
            fingerprints: RwLock::new(fingerprints),
            save_lock: Mutex::new(()),
            locks: PathLocks::default(),
            workers,
        })
    }

    pub fn walk_policy(&self) -> &WalkPolicy {
        &self.config.walk
    }

    /// Index one file and persist the fingerprint store.
    ///
    /// Per-file failures are reported in the outcome; only a failure to
    /// persist the fingerprint store is an error.
    pub async fn upsert(&self, path: &Path) -> Result<UpsertOutcome> {
        let path = normalize_path(path);
        let outcome = {
            let _permit = self.workers.acquire().await?;
            let _guard = self.locks.lock(&path).await;
            self.upsert_locked(&path).await
        };
        self.persist().await?;
        Ok(outcome)
    }

    /// Purge one file from every store. Returns whether it was tracked.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        let path = normalize_path(path);
        let removed = {
            let _guard = self.locks.lock(&path).await;
            self.remove_locked(&path).await?
        };
        self.persist().await?;
        Ok(removed)
    }

    /// Purge many files with one pass over each store.
    pub async fn remove_many(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        if paths.is_empty() {
            return Ok(());
        }
        let (sorted, _guards) = self.lock_sorted(paths).await;
        self.remove_many_locked(&sorted).await
    }

    /// Lock `paths` in sorted order, which keeps concurrent batch
    /// removals deadlock-free.
    async fn lock_sorted(&self, paths: &[PathBuf]) -> (Vec<PathBuf>, Vec<OwnedMutexGuard<()>>) {
        let mut sorted = paths.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for path in &sorted {
            guards.push(self.locks.lock(path).await);
        }
        (sorted, guards)
    }

    /// Caller holds every path lock.
    async fn remove_many_locked(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.vector.delete_many(paths).await?;
        self.keyword.delete_many(paths).await?;
        let mut fingerprints = self.fingerprints.write().await;
        for path in paths {
            fingerprints.state_mut().remove(path);
        }
        debug!("Removed {} paths from the index", paths.len());
        Ok(())
    }

    /// Remove the candidates that still qualify once their path locks are
    /// held. Candidates are computed without locks, so a watcher may have
    /// recreated, indexed or removed any of them since.
    async fn remove_confirmed(
        &self,
        roots: &[PathBuf],
        candidates: &[PathBuf],
        reason: Removal,
    ) -> Result<usize, StoreError> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let (sorted, _guards) = self.lock_sorted(candidates).await;
        let total = sorted.len();
        let confirmed: Vec<PathBuf> = {
            let fingerprints = self.fingerprints.read().await;
            let state = fingerprints.state();
            sorted
                .into_iter()
                .filter(|p| match reason {
                    Removal::Stale => state.get(p).is_some() && !p.exists(),
                    Removal::Orphan => state.get(p).is_none() && !self.is_indexable(roots, p),
                })
                .collect()
        };
        if confirmed.len() < total {
            debug!(
                "{} {:?} candidates changed during the reconcile and were kept",
                total - confirmed.len(),
                reason
            );
        }
        self.remove_many_locked(&confirmed).await?;
        Ok(confirmed.len())
    }

    fn is_indexable(&self, roots: &[PathBuf], path: &Path) -> bool {
        path.is_file() && roots.iter().any(|r| self.config.walk.accepts(r, path))
    }

    /// Bring one path in line with the disk: remove it if it is gone,
    /// reindex it if its content changed, otherwise leave it alone.
    pub async fn sync_path(&self, path: &Path) -> Result<SyncOutcome> {
        let path = normalize_path(path);
        let outcome = {
            // Permit before path lock, matching reconcile's order.
            let _permit = self.workers.acquire().await?;
            let _guard = self.locks.lock(&path).await;
            if !path.exists() {
                SyncOutcome::Removed(self.remove_locked(&path).await?)
            } else {
                match self.is_unchanged(&path).await {
                    Ok(true) => SyncOutcome::Unchanged,
                    Ok(false) => SyncOutcome::Upserted(self.upsert_locked(&path).await),
                    Err(e) => {
                        warn!("Cannot read {:?}: {}", path, e);
                        SyncOutcome::Upserted(UpsertOutcome::Failed(e.to_string()))
                    }
                }
            }
        };
        self.persist().await?;
        Ok(outcome)
    }

    /// Reconcile the index with the files currently under `roots`.
    ///
    /// New and changed files are indexed, files that disappeared are
    /// purged, and paths present in only some of the stores are repaired.
    /// Individual file failures are counted, never propagated.
    pub async fn reconcile(self: &Arc<Self>, roots: &[PathBuf]) -> Result<ReconcileReport> {
        let started = Instant::now();
        let roots: Vec<PathBuf> = roots.iter().map(|r| normalize_path(r)).collect();

        let policy = self.config.walk.clone();
        let walk_roots = roots.clone();
        let files = tokio::task::spawn_blocking(move || policy.collect(&walk_roots))
            .await
            .context("File enumeration task failed")?;
        let current: HashSet<PathBuf> = files.iter().cloned().collect();

        let (first_run, tracked) = {
            let fingerprints = self.fingerprints.read().await;
            let state = fingerprints.state();
            let tracked: HashSet<PathBuf> = state.files.keys().cloned().collect();
            (state.is_first_run(), tracked)
        };
        let (in_vector, in_keyword) = tokio::join!(self.vector.paths(), self.keyword.paths());

        info!(
            "Reconciling {} files under {} roots (first run: {})",
            files.len(),
            roots.len(),
            first_run
        );

        let mut report = ReconcileReport::default();
        let mut tasks = JoinSet::new();
        for path in files {
            let plan = if first_run || !tracked.contains(&path) {
                Plan::Index
            } else if !in_vector.contains(&path) || !in_keyword.contains(&path) {
                Plan::Repair
            } else {
                Plan::Check
            };
            if plan == Plan::Repair {
                debug!("{:?} is missing from a store, reindexing", path);
                report.repaired += 1;
            }

            // Holding a permit before spawning bounds the number of live tasks.
            let permit = self.workers.clone().acquire_owned().await?;
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                this.reconcile_file(&path, plan).await
            });

            while let Some(done) = tasks.try_join_next() {
                self.tally(done, &mut report).await;
            }
        }
        while let Some(done) = tasks.join_next().await {
            self.tally(done, &mut report).await;
        }

        let stale = self.fingerprints.read().await.state().find_stale(&roots, &current);
        if !stale.is_empty() {
            match self.remove_confirmed(&roots, &stale, Removal::Stale).await {
                Ok(removed) => {
                    if removed > 0 {
                        info!("Removed {} files that no longer exist", removed);
                    }
                    report.removed = removed;
                }
                Err(e) => {
                    error!("Failed to remove stale files: {}", e);
                    report.errors += stale.len();
                }
            }
        }

        report.repaired += self.purge_orphans(&roots, &current).await;

        self.fingerprints.write().await.state_mut().mark_reconciled(&roots);
        self.persist().await?;

        info!(
            "Reconcile complete in {:?}: {:?}",
            started.elapsed(),
            report
        );
        Ok(report)
    }

    async fn tally(
        &self,
        done: Result<Step, tokio::task::JoinError>,
        report: &mut ReconcileReport,
    ) {
        match done {
            Ok(Step::Indexed) => report.indexed += 1,
            Ok(Step::Skipped) => report.skipped += 1,
            Ok(Step::Backfilled) => {
                report.skipped += 1;
                report.summarized += 1;
            }
            Ok(Step::Failed) => report.errors += 1,
            Err(e) => {
                error!("Indexing task failed: {}", e);
                report.errors += 1;
            }
        }

        let completed = report.indexed + report.skipped + report.errors;
        if completed % CHECKPOINT_EVERY == 0 {
            if let Err(e) = self.persist().await {
                warn!("Checkpoint failed: {:#}", e);
            }
        }
    }

    async fn reconcile_file(&self, path: &Path, plan: Plan) -> Step {
        let _guard = self.locks.lock(path).await;
        if plan == Plan::Check {
            match self.is_unchanged(path).await {
                Ok(true) => return self.backfill_summary(path).await,
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot read {:?}: {}", path, e);
                    return Step::Failed;
                }
            }
        }
        Step::from(&self.upsert_locked(path).await)
    }

    /// Retry the summary of an unchanged file that was indexed without
    /// one. Caller holds the path lock.
    async fn backfill_summary(&self, path: &Path) -> Step {
        if self.summarizer.is_none() {
            return Step::Skipped;
        }
        let missing = matches!(
            self.fingerprints.read().await.state().get(path),
            Some(record) if record.summary.is_none()
        );
        if !missing {
            return Step::Skipped;
        }

        let owned = path.to_path_buf();
        let extractor = self.extractor.clone();
        let text = match tokio::task::spawn_blocking(move || extractor.extract(&owned)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                debug!("Cannot re-read {:?} for a summary: {}", path, e);
                return Step::Skipped;
            }
            Err(e) => {
                warn!("Extraction task failed for {:?}: {}", path, e);
                return Step::Skipped;
            }
        };
        let Some(summary) = self.summarize(path, &text).await else {
            return Step::Skipped;
        };

        for store in [&self.vector, &self.keyword] {
            if let Err(e) = store.set_summary(path, &summary).await {
                // The record keeps no summary, so the next reconcile retries.
                warn!(
                    "Failed to store the summary of {:?} in the {} store: {}",
                    path,
                    store.name(),
                    e
                );
                return Step::Skipped;
            }
        }
        self.fingerprints.write().await.state_mut().set_summary(path, summary);
        debug!("Backfilled summary for {:?}", path);
        Step::Backfilled
    }

    /// Purge store entries under `roots` that nothing tracks and that no
    /// longer exist as enumerated files.
    async fn purge_orphans(&self, roots: &[PathBuf], current: &HashSet<PathBuf>) -> usize {
        // Candidates only; each is re-checked under its path lock.
        let (in_vector, in_keyword) = tokio::join!(self.vector.paths(), self.keyword.paths());
        let orphans: Vec<PathBuf> = {
            let fingerprints = self.fingerprints.read().await;
            let state = fingerprints.state();
            in_vector
                .union(&in_keyword)
                .filter(|p| roots.iter().any(|r| p.starts_with(r)))
                .filter(|p| !current.contains(*p) && state.get(p).is_none())
                .cloned()
                .collect()
        };
        if orphans.is_empty() {
            return 0;
        }

        match self.remove_confirmed(roots, &orphans, Removal::Orphan).await {
            Ok(purged) => {
                if purged > 0 {
                    warn!("Purged {} untracked paths from the stores", purged);
                }
                purged
            }
            Err(e) => {
                error!("Failed to purge untracked paths: {}", e);
                0
            }
        }
    }

    /// Whether `path` still matches its fingerprint. A metadata match
    /// short-circuits hashing; a hash match refreshes the metadata.
    async fn is_unchanged(&self, path: &Path) -> io::Result<bool> {
        let record = match self.fingerprints.read().await.state().get(path) {
            Some(record) => record.clone(),
            None => return Ok(false),
        };
        let meta = FileMeta::read(path)?;
        if meta == record.meta {
            return Ok(true);
        }

        let owned = path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || hash_file(&owned))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        if hash != record.content_hash {
            return Ok(false);
        }

        debug!("{:?} touched but unchanged", path);
        self.fingerprints.write().await.state_mut().refresh_meta(path, meta);
        Ok(true)
    }

    /// Index one file. Caller holds the path lock.
    async fn upsert_locked(&self, path: &Path) -> UpsertOutcome {
        let meta = match FileMeta::read(path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Cannot read {:?}: {}", path, e);
                return UpsertOutcome::Failed(e.to_string());
            }
        };

        let owned = path.to_path_buf();
        let extractor = self.extractor.clone();
        let read = tokio::task::spawn_blocking(move || {
            (hash_file(&owned), extractor.extract(&owned))
        })
        .await;
        let (hash, text) = match read {
            Ok(read) => read,
            Err(e) => return UpsertOutcome::Failed(format!("extraction task failed: {}", e)),
        };
        let hash = match hash {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Cannot hash {:?}: {}", path, e);
                return UpsertOutcome::Failed(e.to_string());
            }
        };
        let text = match text {
            Ok(text) => text,
            Err(ExtractionError::Empty) => return self.drop_empty(path).await,
            Err(e) => {
                warn!("Extraction failed for {:?}: {}", path, e);
                return UpsertOutcome::Failed(e.to_string());
            }
        };

        let chunks = self.chunker.chunk(path, &text);
        if chunks.is_empty() {
            return self.drop_empty(path).await;
        }

        let summary = self.summarize(path, &text).await;

        if let Err(e) = self.vector.replace(path, &chunks, summary.as_deref()).await {
            warn!("Failed to write {:?} to the {} store: {}", path, self.vector.name(), e);
            return UpsertOutcome::Failed(e.to_string());
        }
        if let Err(e) = self.keyword.replace(path, &chunks, summary.as_deref()).await {
            // The vector store already holds the new chunks; the next
            // reconcile sees the hash mismatch and retries both.
            warn!("Failed to write {:?} to the {} store: {}", path, self.keyword.name(), e);
            return UpsertOutcome::Failed(e.to_string());
        }

        self.fingerprints.write().await.state_mut().record(
            path.to_path_buf(),
            FileRecord {
                content_hash: hash,
                meta,
                last_indexed_at: SystemTime::now(),
                chunk_count: chunks.len(),
                summary,
            },
        );

        debug!("Indexed {:?} ({} chunks)", path, chunks.len());
        UpsertOutcome::Indexed {
            chunks: chunks.len(),
        }
    }

    /// A file with no text holds no entries.
    async fn drop_empty(&self, path: &Path) -> UpsertOutcome {
        debug!("{:?} has no indexable text", path);
        let tracked = self.fingerprints.read().await.state().get(path).is_some();
        if tracked {
            if let Err(e) = self.remove_locked(path).await {
                warn!("Failed to drop emptied file {:?}: {}", path, e);
                return UpsertOutcome::Failed(e.to_string());
            }
        }
        UpsertOutcome::Empty
    }

    async fn summarize(&self, path: &Path, text: &str) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        match summarizer.summarize(text).await {
            Ok(summary) if !summary.trim().is_empty() => Some(summary),
            Ok(_) => None,
            Err(e) => {
                warn!("Summary generation failed for {:?}: {:#}", path, e);
                None
            }
        }
    }

    /// Remove one file from every store. Caller holds the path lock.
    async fn remove_locked(&self, path: &Path) -> Result<bool, StoreError> {
        self.vector.delete(path).await?;
        self.keyword.delete(path).await?;
        let removed = self.fingerprints.write().await.state_mut().remove(path).is_some();
        if removed {
            debug!("Removed {:?} from the index", path);
        }
        Ok(removed)
    }

    /// Flush both stores, then write the fingerprint store.
    ///
    /// Fingerprints are snapshotted before the stores flush, so the saved
    /// state never records an upsert that the flushed stores are missing.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.fingerprints.read().await.clone();
        for store in [&self.vector, &self.keyword] {
            store
                .flush()
                .await
                .with_context(|| format!("Failed to flush the {} store", store.name()))?;
        }
        tokio::task::spawn_blocking(move || snapshot.save())
            .await
            .context("Fingerprint save task failed")?
            .context("Failed to save fingerprint store")?;
        Ok(())
    }

    pub async fn stats(&self) -> IndexStats {
        let (vector_count, keyword_count) = tokio::join!(self.vector.count(), self.keyword.count());
        IndexStats {
            vector_count,
            keyword_count,
            tracked_file_count: self.fingerprints.read().await.state().files.len(),
        }
    }

    pub async fn mode(&self) -> IndexMode {
        self.fingerprints.read().await.state().mode
    }

    /// Roots covered by a completed reconcile.
    pub async fn roots(&self) -> Vec<PathBuf> {
        self.fingerprints.read().await.state().roots.clone()
    }

    pub async fn record(&self, path: &Path) -> Option<FileRecord> {
        let path = normalize_path(path);
        self.fingerprints.read().await.state().get(&path).cloned()
    }

    /// Tracked files whose content hash is `hash`.
    pub async fn find_by_hash(&self, hash: &str) -> Vec<PathBuf> {
        self.fingerprints
            .read()
            .await
            .state()
            .find_by_hash(hash)
            .into_iter()
            .map(Path::to_path_buf)
            .collect()
    }

    /// Other tracked files with exactly the same content as `path`.
    pub async fn duplicates_of(&self, path: &Path) -> Vec<PathBuf> {
        let path = normalize_path(path);
        let fingerprints = self.fingerprints.read().await;
        let state = fingerprints.state();
        let Some(record) = state.get(&path) else {
            return Vec::new();
        };
        state
            .find_by_hash(&record.content_hash)
            .into_iter()
            .filter(|p| *p != path.as_path())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Force the next reconcile to reindex every file.
    pub async fn reset_mode(&self) {
        self.fingerprints.write().await.state_mut().reset_mode();
    }
}

/// Absolute, symlink-free form of `path`. Paths that no longer exist are
/// resolved through their parent directory.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            match std::fs::canonicalize(parent) {
                Ok(parent) => parent.join(name),
                Err(_) => absolute(path),
            }
        }
        _ => absolute(path),
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
