//! Text extraction boundary.
//!
//! The coordinator only needs `extract(path) -> text`. Format-specific
//! parsers plug in by implementing [`Extractor`]; [`TextExtractor`] handles
//! plain text, source code, markup and config files.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Default maximum size for files read as text (10 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8192;

/// Binary document formats that need a dedicated parser.
pub const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "pptx", "ppt", "xlsx", "xls"];

/// Why a file produced no indexable text.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Corrupt or binary content: {0}")]
    Corrupt(String),

    #[error("No text content")]
    Empty,

    #[error("File too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces plain text for a file.
///
/// Extraction is blocking; callers run it on a blocking thread.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String, ExtractionError>;
}

/// Extractor for text-like formats.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    max_bytes: u64,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES)
    }
}

impl TextExtractor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    fn is_document(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                DOCUMENT_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    /// Decode bytes as UTF-8, stripping a BOM and replacing invalid sequences.
    fn decode(bytes: &[u8]) -> String {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Extractor for TextExtractor {
    fn extract(&self, path: &Path) -> Result<String, ExtractionError> {
        if Self::is_document(path) {
            return Err(ExtractionError::Unsupported(path.display().to_string()));
        }

        let size = std::fs::metadata(path)?.len();
        if size > self.max_bytes {
            return Err(ExtractionError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        let mut bytes = Vec::with_capacity(size as usize);
        std::fs::File::open(path)?.read_to_end(&mut bytes)?;

        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
        if sniff.contains(&0) {
            return Err(ExtractionError::Corrupt(format!(
                "{} looks like a binary file",
                path.display()
            )));
        }

        let text = Self::decode(&bytes);
        if text.trim().is_empty() {
            return Err(ExtractionError::Empty);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extract_plain_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Title\n\nBody").unwrap();

        let text = TextExtractor::default().extract(&path).unwrap();
        assert_eq!(text, "# Title\n\nBody");
    }

    #[test]
    fn test_extract_strips_bom_and_replaces_invalid_utf8() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin.txt");
        std::fs::write(&path, b"\xEF\xBB\xBFcaf\xE9").unwrap();

        let text = TextExtractor::default().extract(&path).unwrap();
        assert!(text.starts_with("caf"));
        assert!(!text.starts_with('\u{feff}'));
    }

    #[test]
    fn test_extract_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "  \n\t ").unwrap();

        let result = TextExtractor::default().extract(&path);
        assert!(matches!(result, Err(ExtractionError::Empty)));
    }

    #[test]
    fn test_extract_binary_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.txt");
        std::fs::write(&path, [b'a', 0, b'b']).unwrap();

        let result = TextExtractor::default().extract(&path);
        assert!(matches!(result, Err(ExtractionError::Corrupt(_))));
    }

    #[test]
    fn test_extract_document_unsupported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.PDF");
        std::fs::write(&path, "%PDF-1.4").unwrap();

        let result = TextExtractor::default().extract(&path);
        assert!(matches!(result, Err(ExtractionError::Unsupported(_))));
    }

    #[test]
    fn test_extract_too_large() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(64)).unwrap();

        let result = TextExtractor::new(16).extract(&path);
        assert!(matches!(
            result,
            Err(ExtractionError::TooLarge { size: 64, limit: 16 })
        ));
    }

    #[test]
    fn test_extract_missing_file() {
        let result = TextExtractor::default().extract(Path::new("/nonexistent/file.txt"));
        assert!(matches!(result, Err(ExtractionError::Io(_))));
    }
}
