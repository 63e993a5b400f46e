//! Deterministic collaborators for unit tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::chunker::Chunk;
use crate::embeddings::EmbeddingProvider;
use crate::extract::{ExtractionError, Extractor, TextExtractor};
use crate::index::{ChunkHit, ChunkIndex, StoreError};
use crate::summarize::Summarizer;

/// Embeds text as counts of word groups, one axis per group plus a small
/// constant axis so no vector is all zeros.
pub struct AxisEmbedder {
    groups: Vec<Vec<String>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl AxisEmbedder {
    pub fn new(groups: &[&[&str]]) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|g| g.iter().map(|w| w.to_string()).collect())
                .collect(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let mut v: Vec<f32> = self
            .groups
            .iter()
            .map(|g| words.iter().filter(|w| g.iter().any(|t| t == *w)).count() as f32)
            .collect();
        v.push(0.1);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for AxisEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_batch(&[text.to_string()]).await?.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("embedding service unavailable"));
        }
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.groups.len() + 1
    }

    fn model_name(&self) -> &str {
        "axis"
    }

    fn max_batch_size(&self) -> usize {
        4
    }
}

/// Text extractor that rejects `.pdf` files as corrupt.
pub struct PdfFailsExtractor;

impl Extractor for PdfFailsExtractor {
    fn extract(&self, path: &Path) -> Result<String, ExtractionError> {
        if path.extension().and_then(|e| e.to_str()) == Some("pdf") {
            return Err(ExtractionError::Corrupt(path.display().to_string()));
        }
        TextExtractor::default().extract(path)
    }
}

/// Summarizer returning the first words of the text. It can be told to
/// fail its first few calls.
pub struct FirstWordsSummarizer {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FirstWordsSummarizer {
    pub fn new() -> Self {
        Self::failing_times(0)
    }

    /// Never succeeds.
    pub fn failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FirstWordsSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for FirstWordsSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("summarizer offline"));
        }
        Ok(text.split_whitespace().take(3).collect::<Vec<_>>().join(" "))
    }
}

/// Extractor that parks every call until released, returning fixed text.
pub struct GatedExtractor {
    text: String,
    open: Mutex<bool>,
    opened: Condvar,
    entered: Notify,
}

impl GatedExtractor {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            open: Mutex::new(false),
            opened: Condvar::new(),
            entered: Notify::new(),
        }
    }

    /// Resolves once an extraction is parked.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl Extractor for GatedExtractor {
    fn extract(&self, _path: &Path) -> Result<String, ExtractionError> {
        self.entered.notify_one();
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        Ok(self.text.clone())
    }
}

/// Wraps a store, counting flushes. `holding` parks `replace` for one
/// path until [`InstrumentedIndex::release`] is called.
pub struct InstrumentedIndex {
    inner: Arc<dyn ChunkIndex>,
    hold: Option<PathBuf>,
    entered: Notify,
    release: Semaphore,
    flushes: AtomicUsize,
}

impl InstrumentedIndex {
    pub fn new(inner: Arc<dyn ChunkIndex>) -> Self {
        Self {
            inner,
            hold: None,
            entered: Notify::new(),
            release: Semaphore::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn holding(inner: Arc<dyn ChunkIndex>, path: PathBuf) -> Self {
        Self {
            hold: Some(path),
            ..Self::new(inner)
        }
    }

    /// Resolves once a held `replace` is parked.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkIndex for InstrumentedIndex {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn add(&self, chunks: &[Chunk], summary: Option<&str>) -> Result<(), StoreError> {
        self.inner.add(chunks, summary).await
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        self.inner.delete(path).await
    }

    async fn delete_many(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        self.inner.delete_many(paths).await
    }

    async fn replace(
        &self,
        path: &Path,
        chunks: &[Chunk],
        summary: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.hold.as_deref() == Some(path) {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
        }
        self.inner.replace(path, chunks, summary).await
    }

    async fn set_summary(&self, path: &Path, summary: &str) -> Result<usize, StoreError> {
        self.inner.set_summary(path, summary).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<ChunkHit>, StoreError> {
        self.inner.query(text, k).await
    }

    async fn count(&self) -> usize {
        self.inner.count().await
    }

    async fn paths(&self) -> HashSet<PathBuf> {
        self.inner.paths().await
    }
}
