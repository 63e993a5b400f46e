//! File watcher for live index updates.
//!
//! [`FileWatcher`] turns raw notifications under the monitored roots into
//! debounced [`FileEvent`]s. [`IndexQueue`] applies those events through
//! the coordinator, never running two operations on the same path at once
//! and keeping only the latest event for a path that is busy.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::coordinator::{IndexCoordinator, SyncOutcome, UpsertOutcome};
use crate::walk::WalkPolicy;

/// Default quiet period before an event is emitted.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Errors that can occur in the file watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(String),

    #[error("Failed to watch path: {0}")]
    WatchError(String),

    #[error("Watcher is not running")]
    NotRunning,
}

/// Events emitted by the file watcher.
///
/// Renames arrive as a `Deleted` for the old path and a `Created` for the
/// new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(p) | FileEvent::Modified(p) | FileEvent::Deleted(p) => p,
        }
    }
}

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Pending event state for debouncing.
#[derive(Debug, Clone)]
struct PendingEvent {
    /// The merged event for this path
    event: FileEvent,
    /// When the most recent event was received
    last_seen: Instant,
}

/// Watches one or more roots for changes to eligible files.
pub struct FileWatcher {
    config: WatcherConfig,
    policy: WalkPolicy,
    roots: Arc<RwLock<Vec<PathBuf>>>,
    // Dropping the notify watcher ends the event stream
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(config: WatcherConfig, policy: WalkPolicy) -> Self {
        Self {
            config,
            policy,
            roots: Arc::new(RwLock::new(Vec::new())),
            watcher: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Start watching `roots` and return a channel of debounced events.
    ///
    /// Multiple rapid changes to the same file are merged into a single
    /// event emitted once the file has been quiet for the debounce period.
    pub fn start(&mut self, roots: &[PathBuf]) -> Result<mpsc::Receiver<FileEvent>, WatcherError> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<FileEvent>(1024);
        let (debounced_tx, debounced_rx) = mpsc::channel(256);
        let debounce_duration = self.config.debounce;
        let policy = self.policy.clone();
        let watched = self.roots.clone();

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let roots = match watched.read() {
                        Ok(roots) => roots.clone(),
                        Err(poisoned) => poisoned.into_inner().clone(),
                    };
                    for file_event in Self::convert_event(event, &roots, &policy) {
                        // Best effort; the next reconcile catches anything dropped
                        let _ = raw_tx.blocking_send(file_event);
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            }
        })
        .map_err(|e| WatcherError::CreateError(e.to_string()))?;
        self.watcher = Some(watcher);

        for root in roots {
            self.add_root(root)?;
        }

        tokio::spawn(async move {
            Self::debounce_events(&mut raw_rx, debounced_tx, debounce_duration).await;
        });

        info!(
            "Started watching {} roots with {:?} debounce",
            roots.len(),
            debounce_duration
        );
        Ok(debounced_rx)
    }

    /// Watch an additional root on a running watcher.
    pub fn add_root(&mut self, root: &Path) -> Result<(), WatcherError> {
        let watcher = self.watcher.as_mut().ok_or(WatcherError::NotRunning)?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchError(format!("{}: {}", root.display(), e)))?;

        let mut roots = self.roots.write().unwrap_or_else(|e| e.into_inner());
        if !roots.iter().any(|r| r == root) {
            roots.push(root.to_path_buf());
        }
        debug!("Watching {:?}", root);
        Ok(())
    }

    /// Debounce events by batching rapid changes to the same file.
    async fn debounce_events(
        raw_rx: &mut mpsc::Receiver<FileEvent>,
        debounced_tx: mpsc::Sender<FileEvent>,
        debounce_duration: Duration,
    ) {
        let mut pending: HashMap<PathBuf, PendingEvent> = HashMap::new();
        let tick_interval = Duration::from_millis(50);

        loop {
            match tokio::time::timeout(tick_interval, raw_rx.recv()).await {
                Ok(Some(event)) => {
                    let now = Instant::now();
                    pending
                        .entry(event.path().to_path_buf())
                        .and_modify(|p| {
                            p.event = Self::merge_events(&p.event, &event);
                            p.last_seen = now;
                        })
                        .or_insert(PendingEvent {
                            event,
                            last_seen: now,
                        });
                }
                Ok(None) => {
                    // Channel closed, flush remaining events and exit
                    for (_, pending_event) in pending.drain() {
                        let _ = debounced_tx.send(pending_event.event).await;
                    }
                    break;
                }
                Err(_) => {}
            }

            let now = Instant::now();
            let mut to_emit = Vec::new();
            pending.retain(|_, pending_event| {
                if now.duration_since(pending_event.last_seen) >= debounce_duration {
                    to_emit.push(pending_event.event.clone());
                    false
                } else {
                    true
                }
            });

            for event in to_emit {
                if debounced_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Merge two events for the same file.
    ///
    /// - Delete followed by anything else means the file came back
    /// - Create followed by modify is still a create
    /// - Otherwise the newer event wins
    fn merge_events(existing: &FileEvent, new: &FileEvent) -> FileEvent {
        match (existing, new) {
            (_, FileEvent::Deleted(p)) => FileEvent::Deleted(p.clone()),
            (FileEvent::Deleted(_), FileEvent::Created(p) | FileEvent::Modified(p)) => {
                FileEvent::Modified(p.clone())
            }
            (FileEvent::Created(p), FileEvent::Modified(_)) => FileEvent::Created(p.clone()),
            (_, newer) => newer.clone(),
        }
    }

    /// Stop watching. Pending debounced events are still delivered.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopped watching {:?}", self.roots());
        }
    }

    /// Convert a notify event to our event type, dropping paths the walk
    /// policy would not index.
    fn convert_event(event: Event, roots: &[PathBuf], policy: &WalkPolicy) -> Vec<FileEvent> {
        let eligible = |path: &Path| roots.iter().any(|root| policy.accepts(root, path));

        let raw: Vec<FileEvent> = match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                vec![
                    FileEvent::Deleted(event.paths[0].clone()),
                    FileEvent::Created(event.paths[1].clone()),
                ]
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                event.paths.into_iter().map(FileEvent::Deleted).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => {
                event.paths.into_iter().map(FileEvent::Created).collect()
            }
            EventKind::Modify(_) => event.paths.into_iter().map(FileEvent::Modified).collect(),
            EventKind::Remove(_) => event.paths.into_iter().map(FileEvent::Deleted).collect(),
            _ => Vec::new(),
        };

        raw.into_iter().filter(|e| eligible(e.path())).collect()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reports a finished operation back to the queue, even on panic.
struct Completion {
    path: Option<PathBuf>,
    done: mpsc::UnboundedSender<PathBuf>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = self.done.send(path);
        }
    }
}

/// Gate shared with whoever needs the queue quiet. Each operation holds
/// it for reading, so a writer waits out in-flight work and blocks new work.
pub type PauseGate = Arc<tokio::sync::RwLock<()>>;

/// Applies watcher events to the index through the coordinator.
pub struct IndexQueue {
    coordinator: Arc<IndexCoordinator>,
    pause: PauseGate,
}

impl IndexQueue {
    pub fn new(coordinator: Arc<IndexCoordinator>) -> Self {
        Self {
            coordinator,
            pause: PauseGate::default(),
        }
    }

    pub fn with_pause(mut self, pause: PauseGate) -> Self {
        self.pause = pause;
        self
    }

    /// Consume `events` until the channel closes and all in-flight
    /// operations finish.
    ///
    /// At most one operation per path runs at a time. Events for a busy
    /// path collapse into a single pending slot, last event wins.
    pub async fn run(self, mut events: mpsc::Receiver<FileEvent>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut in_flight: HashSet<PathBuf> = HashSet::new();
        let mut pending: HashMap<PathBuf, FileEvent> = HashMap::new();
        let mut open = true;

        while open || !in_flight.is_empty() {
            tokio::select! {
                event = events.recv(), if open => match event {
                    Some(event) => {
                        let path = event.path().to_path_buf();
                        if in_flight.contains(&path) {
                            pending.insert(path, event);
                        } else {
                            in_flight.insert(path.clone());
                            self.dispatch(path, event, &done_tx);
                        }
                    }
                    None => open = false,
                },
                Some(path) = done_rx.recv() => {
                    match pending.remove(&path) {
                        Some(event) => self.dispatch(path, event, &done_tx),
                        None => {
                            in_flight.remove(&path);
                        }
                    }
                }
            }
        }
        debug!("Index queue drained");
    }

    fn dispatch(&self, path: PathBuf, event: FileEvent, done: &mpsc::UnboundedSender<PathBuf>) {
        let coordinator = self.coordinator.clone();
        let pause = self.pause.clone();
        let completion = Completion {
            path: Some(path),
            done: done.clone(),
        };
        tokio::spawn(async move {
            let _completion = completion;
            let _running = pause.read_owned().await;
            Self::handle(&coordinator, event).await;
        });
    }

    async fn handle(coordinator: &IndexCoordinator, event: FileEvent) {
        let result = match &event {
            FileEvent::Created(path) => Self::on_created(coordinator, path).await,
            FileEvent::Modified(path) => Self::on_modified(coordinator, path).await,
            FileEvent::Deleted(path) => Self::on_deleted(coordinator, path).await,
        };
        match result {
            Ok(SyncOutcome::Upserted(UpsertOutcome::Failed(reason))) => {
                error!("Failed to index {:?}: {}", event.path(), reason)
            }
            Ok(outcome) => debug!("{:?} -> {:?}", event, outcome),
            Err(e) => error!("Failed to apply {:?}: {:#}", event, e),
        }
    }

    async fn on_created(coordinator: &IndexCoordinator, path: &Path) -> anyhow::Result<SyncOutcome> {
        debug!("File created: {:?}", path);
        coordinator.sync_path(path).await
    }

    async fn on_modified(coordinator: &IndexCoordinator, path: &Path) -> anyhow::Result<SyncOutcome> {
        debug!("File changed: {:?}", path);
        coordinator.sync_path(path).await
    }

    /// The file may have been recreated since the event fired, so the disk
    /// decides between removal and reindexing.
    async fn on_deleted(coordinator: &IndexCoordinator, path: &Path) -> anyhow::Result<SyncOutcome> {
        debug!("File deleted: {:?}", path);
        coordinator.sync_path(path).await
    }
}
