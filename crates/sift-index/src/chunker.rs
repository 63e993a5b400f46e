//! Fixed-window text chunking.
//!
//! Extracted text is split into overlapping windows measured in characters
//! (not bytes), so multi-byte text never gets cut inside a code point.
//! Chunking is deterministic: the same text always yields the same
//! boundaries and sequence indices.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default window size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 600;

/// Default overlap between consecutive windows in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// Errors that can occur during chunking.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("Invalid chunker config: size={size}, overlap={overlap} (need 0 < size and overlap < size)")]
    InvalidConfig { size: usize, overlap: usize },
}

/// Identity of a chunk: owning file plus position within that file.
///
/// Ordering is by path then sequence index, which is the tie-break order
/// used when ranking results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub path: PathBuf,
    pub sequence_index: usize,
}

impl ChunkKey {
    pub fn new(path: impl Into<PathBuf>, sequence_index: usize) -> Self {
        Self {
            path: path.into(),
            sequence_index,
        }
    }

    /// Stable string id, e.g. `/docs/a.md:chunk:2`.
    pub fn id(&self) -> String {
        format!("{}:chunk:{}", self.path.display(), self.sequence_index)
    }
}

/// A contiguous slice of a file's extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning file
    pub source_path: PathBuf,

    /// Position among the chunks of the same file
    pub sequence_index: usize,

    /// The slice content
    pub text: String,

    /// Characters shared with the previous chunk
    pub offset_overlap: usize,

    /// Start offset in characters within the extracted text
    pub char_start: usize,

    /// End offset in characters (exclusive)
    pub char_end: usize,
}

impl Chunk {
    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.source_path.clone(), self.sequence_index)
    }
}

/// Chunker with a validated window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self, ChunkerError> {
        if size == 0 || overlap >= size {
            return Err(ChunkerError::InvalidConfig { size, overlap });
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into chunks owned by `source_path`.
    pub fn chunk(&self, source_path: &Path, text: &str) -> Vec<Chunk> {
        window_spans(text.chars().count(), self.size, self.overlap)
            .into_iter()
            .enumerate()
            .map(|(sequence_index, (start, end))| Chunk {
                source_path: source_path.to_path_buf(),
                sequence_index,
                text: char_slice(text, start, end).to_string(),
                offset_overlap: if sequence_index == 0 { 0 } else { self.overlap },
                char_start: start,
                char_end: end,
            })
            .collect()
    }
}

/// Chunk `text` with an explicit window configuration.
pub fn chunk(
    source_path: &Path,
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkerError> {
    Ok(Chunker::new(size, overlap)?.chunk(source_path, text))
}

/// Character spans `[start, end)` covering `len` characters.
fn window_spans(len: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    if len == 0 {
        return spans;
    }

    let step = size - overlap;
    let mut start = 0;
    loop {
        let end = (start + size).min(len);
        spans.push((start, end));
        if end == len {
            break;
        }
        start += step;
    }
    spans
}

/// Slice `text` by character offsets.
fn char_slice(text: &str, start: usize, end: usize) -> &str {
    let mut indices = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
    let byte_start = indices.nth(start).unwrap_or(text.len());
    let byte_end = if end > start {
        indices.nth(end - start - 1).unwrap_or(text.len())
    } else {
        byte_start
    };
    &text[byte_start..byte_end]
}
