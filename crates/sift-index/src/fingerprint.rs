//! Content fingerprint store.
//!
//! Persists, for every tracked file, the hash of its bytes and when it was
//! last indexed. The coordinator consults it to decide what needs
//! (re)indexing and is the only component allowed to mutate it.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::persist::{atomic_write, unix_nanos};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

/// Whether the next reconcile must index everything unconditionally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    #[default]
    FirstRun,
    Incremental,
}

/// Cheap file metadata used as a pre-filter before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub modified_ns: u64,
}

impl FileMeta {
    pub fn read(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_ns = metadata.modified().map(unix_nanos).unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            modified_ns,
        })
    }
}

/// Fingerprint of one tracked file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// SHA256 of the raw file bytes
    pub content_hash: String,

    /// Size and mtime observed when the hash was taken
    pub meta: FileMeta,

    /// When the file was last successfully indexed
    pub last_indexed_at: SystemTime,

    /// Number of chunks written for this file
    pub chunk_count: usize,

    /// File-level summary, if one was generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Persisted indexing state: mode, monitored roots and the fingerprint map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexState {
    pub version: u32,
    pub mode: IndexMode,
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    pub last_full_scan: Option<SystemTime>,
    pub files: BTreeMap<PathBuf, FileRecord>,
}

impl Default for IndexState {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            mode: IndexMode::FirstRun,
            roots: Vec::new(),
            last_full_scan: None,
            files: BTreeMap::new(),
        }
    }

    pub fn is_first_run(&self) -> bool {
        self.mode == IndexMode::FirstRun
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.files.get(path)
    }

    /// Insert or refresh the record for `path`.
    pub fn record(&mut self, path: PathBuf, record: FileRecord) {
        self.files.insert(path, record);
    }

    /// Update only the metadata of a record whose content hash still matches.
    pub fn refresh_meta(&mut self, path: &Path, meta: FileMeta) {
        if let Some(record) = self.files.get_mut(path) {
            record.meta = meta;
        }
    }

    pub fn remove(&mut self, path: &Path) -> Option<FileRecord> {
        self.files.remove(path)
    }

    /// Attach a summary to an existing record.
    pub fn set_summary(&mut self, path: &Path, summary: String) {
        if let Some(record) = self.files.get_mut(path) {
            record.summary = Some(summary);
        }
    }

    /// Tracked paths whose content hash is `hash`, in path order.
    pub fn find_by_hash(&self, hash: &str) -> Vec<&Path> {
        self.files
            .iter()
            .filter(|(_, r)| r.content_hash == hash)
            .map(|(p, _)| p.as_path())
            .collect()
    }

    /// Tracked paths under `roots` that are neither in `current` nor on disk.
    pub fn find_stale(&self, roots: &[PathBuf], current: &HashSet<PathBuf>) -> Vec<PathBuf> {
        self.files
            .keys()
            .filter(|p| roots.iter().any(|r| p.starts_with(r)))
            .filter(|p| !current.contains(*p) && !p.exists())
            .cloned()
            .collect()
    }

    /// Mark a reconcile pass over `roots` as complete.
    pub fn mark_reconciled(&mut self, roots: &[PathBuf]) {
        for root in roots {
            if !self.roots.contains(root) {
                self.roots.push(root.clone());
            }
        }
        self.mode = IndexMode::Incremental;
        self.last_full_scan = Some(SystemTime::now());
    }

    /// Force the next reconcile to reindex everything.
    pub fn reset_mode(&mut self) {
        self.mode = IndexMode::FirstRun;
    }
}

/// An [`IndexState`] bound to the file it is persisted in.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    path: PathBuf,
    state: IndexState,
}

impl FingerprintStore {
    /// Load the store, starting a fresh first-run state if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FingerprintError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(FingerprintError::Parse)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => IndexState::new(),
            Err(e) => return Err(FingerprintError::Io(e)),
        };
        Ok(Self { path, state })
    }

    /// Write the state to disk atomically.
    pub fn save(&self) -> Result<(), FingerprintError> {
        let content =
            serde_json::to_vec_pretty(&self.state).map_err(FingerprintError::Serialize)?;
        atomic_write(&self.path, &content).map_err(FingerprintError::Io)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut IndexState {
        &mut self.state
    }
}

/// Hash the raw bytes of a file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Errors that can occur when loading or saving the fingerprint store.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse index state: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize index state: {0}")]
    Serialize(#[source] serde_json::Error),
}
