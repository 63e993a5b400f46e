//! Configuration management for sift.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `SIFT__`-prefixed environment variables using `__` as the section
//! separator (`SIFT__RETRIEVAL__VECTOR_WEIGHT=0.8`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sift_index::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use sift_index::coordinator::DEFAULT_WORKERS;
use sift_index::embeddings::{
    DEFAULT_BATCH_SIZE, DEFAULT_EMBEDDINGS_DIMENSIONS, DEFAULT_EMBEDDINGS_MODEL,
    DEFAULT_EMBEDDINGS_URL,
};
use sift_index::extract::DEFAULT_MAX_FILE_BYTES;
use sift_index::summarize::DEFAULT_MAX_INPUT_CHARS;
use sift_index::walk::{DEFAULT_EXTENSIONS, DEFAULT_IGNORE_DIRS, DEFAULT_IGNORE_FILES};
use sift_index::watcher::DEFAULT_DEBOUNCE;
use thiserror::Error;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SIFT";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the fingerprint, vector and keyword stores live
    pub data_dir: PathBuf,

    /// Folders reconciled and watched
    pub roots: Vec<PathBuf>,

    pub indexing: IndexingConfig,
    pub embeddings: EmbeddingsConfig,
    pub summaries: SummariesConfig,
    pub retrieval: RetrievalConfig,
    pub watcher: WatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            roots: Vec::new(),
            indexing: IndexingConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            summaries: SummariesConfig::default(),
            retrieval: RetrievalConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sift")
}

/// What gets indexed and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
    pub ignore_files: Vec<String>,
    pub respect_gitignore: bool,
    pub max_file_bytes: u64,
    pub workers: usize,
    pub embedding_batch_size: usize,
    pub rebuild_on_corrupt: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            extensions: to_strings(DEFAULT_EXTENSIONS),
            ignore_dirs: to_strings(DEFAULT_IGNORE_DIRS),
            ignore_files: to_strings(DEFAULT_IGNORE_FILES),
            respect_gitignore: true,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            workers: DEFAULT_WORKERS,
            embedding_batch_size: DEFAULT_BATCH_SIZE,
            rebuild_on_corrupt: true,
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    /// Literal key or `${ENV_VAR}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EMBEDDINGS_URL.to_string(),
            model: DEFAULT_EMBEDDINGS_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDINGS_DIMENSIONS,
            api_key: None,
        }
    }
}

/// Optional file summaries from an OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummariesConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_input_chars: usize,
}

impl Default for SummariesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

/// Hybrid search tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub overfetch: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
    pub default_k: usize,
    pub ask_k: usize,
    pub max_chunks_per_file: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let engine = sift_index::RetrievalConfig::default();
        Self {
            vector_weight: engine.vector_weight,
            keyword_weight: engine.keyword_weight,
            overfetch: engine.overfetch,
            min_score: engine.min_score,
            default_k: 5,
            ask_k: 8,
            max_chunks_per_file: engine.max_chunks_per_file,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sift").join("config.toml"))
    }

    /// Load configuration from `path` (or the default location) and the
    /// environment. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let file = path.map(Path::to_path_buf).or_else(Self::default_path);
        if let Some(file) = file {
            // An explicitly named file must exist.
            builder = builder.add_source(
                config::File::from(file)
                    .format(config::FileFormat::Toml)
                    .required(path.is_some()),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("roots")
                .try_parsing(true),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn expand_paths(&mut self) {
        self.data_dir = expand(&self.data_dir);
        for root in &mut self.roots {
            *root = expand(root);
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let indexing = &self.indexing;
        if indexing.chunk_size == 0 {
            return invalid("indexing.chunk_size must be > 0");
        }
        if indexing.chunk_overlap >= indexing.chunk_size {
            return invalid(format!(
                "indexing.chunk_overlap ({}) must be smaller than indexing.chunk_size ({})",
                indexing.chunk_overlap, indexing.chunk_size
            ));
        }
        if indexing.workers == 0 {
            return invalid("indexing.workers must be >= 1");
        }
        if indexing.embedding_batch_size == 0 {
            return invalid("indexing.embedding_batch_size must be >= 1");
        }
        if self.embeddings.dimensions == 0 {
            return invalid("embeddings.dimensions must be > 0");
        }

        let retrieval = &self.retrieval;
        if retrieval.vector_weight < 0.0 || retrieval.keyword_weight < 0.0 {
            return invalid("retrieval weights must not be negative");
        }
        if retrieval.vector_weight + retrieval.keyword_weight <= 0.0 {
            return invalid("retrieval.vector_weight and retrieval.keyword_weight cannot both be 0");
        }
        if retrieval.overfetch == 0 {
            return invalid("retrieval.overfetch must be >= 1");
        }
        if retrieval.max_chunks_per_file == 0 {
            return invalid("retrieval.max_chunks_per_file must be >= 1");
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

fn expand(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).into_owned()),
        None => path.to_path_buf(),
    }
}

/// Resolve an optional API key value, expanding `${ENV_VAR}` syntax.
///
/// Returns `None` when no key is configured, the variable is unset, or the
/// value is empty.
pub fn resolve_api_key(api_key: &Option<String>) -> Option<String> {
    match api_key {
        Some(key) if key.starts_with("${") && key.ends_with('}') => {
            let var_name = &key[2..key.len() - 1];
            std::env::var(var_name).ok().filter(|v| !v.is_empty())
        }
        Some(key) if !key.is_empty() => Some(key.clone()),
        _ => None,
    }
}
