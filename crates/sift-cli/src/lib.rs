//! Command line interface for sift.

mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sift_config::{resolve_api_key, Config};
use sift_index::{
    ChatSummarizer, CoordinatorConfig, Engine, EngineConfig, OpenAiCompatEmbeddings,
    RetrievalConfig, Summarizer, TextExtractor, WalkPolicy, WatcherConfig,
};

use output::StatsReport;

#[derive(Parser, Debug)]
#[command(name = "sift")]
#[command(version, about = "Incremental local file indexing with hybrid search", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Bring the index up to date with the configured roots and ROOTS
    Index {
        roots: Vec<PathBuf>,

        /// Reindex every file regardless of stored fingerprints
        #[arg(long)]
        reset: bool,

        #[arg(long)]
        json: bool,
    },

    /// Reconcile, then keep the index live until Ctrl-C
    Watch { roots: Vec<PathBuf> },

    /// Index a new folder and remember it as a root
    AddFolder {
        path: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Hybrid search over indexed chunks
    Search {
        query: String,

        /// Number of results (defaults to retrieval.default_k)
        #[arg(short, long)]
        k: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Retrieve answer context spread across source files
    Ask {
        query: String,

        /// Number of chunks (defaults to retrieval.ask_k)
        #[arg(short, long)]
        k: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show index counts, roots and mode
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!("Using data directory {:?}", config.data_dir);

    if cli.command == Command::Config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let engine = open_engine(&config)?;
    execute(&engine, &config, cli.command).await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "sift=debug" } else { "sift=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Already installed when embedded in a host that set its own subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn execute(engine: &Engine, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Index { roots, reset, json } => {
            let roots = merge_roots(&config.roots, &roots);
            ensure_roots(engine, &roots).await?;
            if reset {
                info!("Resetting fingerprints, every file will be reindexed");
                engine.coordinator().reset_mode().await;
            }
            let report = engine.reconcile(&roots).await?;
            if json {
                println!("{}", output::to_json(&report));
            } else {
                println!("{}", output::format_reconcile(&report));
            }
        }
        Command::Watch { roots } => {
            let roots = merge_roots(&config.roots, &roots);
            ensure_roots(engine, &roots).await?;
            let report = engine.watch(&roots).await?;
            println!("{}", output::format_reconcile(&report));
            println!("Watching {} root(s), press Ctrl-C to stop", engine.roots().await.len());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Stopping watcher");
            engine.stop_watching().await?;
        }
        Command::AddFolder { path, json } => {
            let report = engine.add_folder(&path).await?;
            if json {
                println!("{}", output::to_json(&report));
            } else {
                println!("{}", output::format_folder(&path, &report));
            }
        }
        Command::Search { query, k, json } => {
            let k = k.unwrap_or(config.retrieval.default_k);
            let results = engine.search(&query, k).await?;
            if json {
                println!("{}", output::format_results_json(&query, &results));
            } else {
                println!("{}", output::format_results_human(&query, &results));
            }
        }
        Command::Ask { query, k, json } => {
            let k = k.unwrap_or(config.retrieval.ask_k);
            let results = engine.ask_context(&query, k).await?;
            if json {
                println!("{}", output::format_results_json(&query, &results));
            } else {
                println!("{}", output::format_context_human(&query, &results));
            }
        }
        Command::Stats { json } => {
            let report = StatsReport {
                counts: engine.stats().await,
                embedding_model: config.embeddings.model.clone(),
                mode: engine.mode().await,
                roots: engine.roots().await,
            };
            if json {
                println!("{}", output::to_json(&report));
            } else {
                println!("{}", output::format_stats(&report));
            }
        }
        Command::Config => print!("{}", config.to_toml()?),
    }
    Ok(())
}

/// Configured roots followed by any extra ones, without duplicates.
fn merge_roots(configured: &[PathBuf], extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::with_capacity(configured.len() + extra.len());
    for root in configured.iter().chain(extra) {
        if !roots.contains(root) {
            roots.push(root.clone());
        }
    }
    roots
}

async fn ensure_roots(engine: &Engine, roots: &[PathBuf]) -> Result<()> {
    if roots.is_empty() && engine.roots().await.is_empty() {
        anyhow::bail!(
            "No folders to index. Pass one on the command line or set `roots` in the configuration"
        );
    }
    Ok(())
}

/// Translate user configuration into engine settings.
pub fn engine_config(config: &Config) -> EngineConfig {
    let indexing = &config.indexing;
    let walk = WalkPolicy::new(
        indexing.extensions.iter().cloned(),
        indexing.ignore_dirs.iter().cloned(),
        indexing.ignore_files.iter().cloned(),
    )
    .with_gitignore(indexing.respect_gitignore);

    let mut engine = EngineConfig::new(&config.data_dir);
    engine.coordinator = CoordinatorConfig {
        chunk_size: indexing.chunk_size,
        chunk_overlap: indexing.chunk_overlap,
        workers: indexing.workers,
        walk,
    };
    engine.retrieval = RetrievalConfig {
        vector_weight: config.retrieval.vector_weight,
        keyword_weight: config.retrieval.keyword_weight,
        overfetch: config.retrieval.overfetch,
        min_score: config.retrieval.min_score,
        max_chunks_per_file: config.retrieval.max_chunks_per_file,
    };
    engine.watcher = WatcherConfig {
        debounce: Duration::from_millis(config.watcher.debounce_ms),
    };
    engine.rebuild_on_corrupt = indexing.rebuild_on_corrupt;
    engine
}

fn open_engine(config: &Config) -> Result<Engine> {
    let embeddings = &config.embeddings;
    let embedder = OpenAiCompatEmbeddings::new(
        Some(embeddings.model.clone()),
        Some(embeddings.dimensions),
    )
    .with_base_url(embeddings.base_url.clone())
    .with_api_key(resolve_api_key(&embeddings.api_key))
    .with_batch_size(config.indexing.embedding_batch_size);

    let extractor = TextExtractor::new(config.indexing.max_file_bytes);
    let summarizer = summarizer(config);

    Engine::open(
        engine_config(config),
        Arc::new(embedder),
        Arc::new(extractor),
        summarizer,
    )
    .with_context(|| format!("Failed to open index in {}", config.data_dir.display()))
}

fn summarizer(config: &Config) -> Option<Arc<dyn Summarizer>> {
    let summaries = &config.summaries;
    if !summaries.enabled {
        return None;
    }
    let summarizer = ChatSummarizer::new(
        summaries.base_url.clone(),
        summaries.model.clone(),
        resolve_api_key(&summaries.api_key),
    )
    .with_max_input_chars(summaries.max_input_chars);
    Some(Arc::new(summarizer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from(["sift", "search", "quarterly ledger", "-k", "3", "--json"])
            .unwrap();
        assert_eq!(
            cli.command,
            Command::Search {
                query: "quarterly ledger".to_string(),
                k: Some(3),
                json: true,
            }
        );
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sift", "stats", "-v", "--config", "/tmp/sift.toml"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sift.toml")));
        assert_eq!(cli.command, Command::Stats { json: false });
    }

    #[test]
    fn test_parse_index_roots() {
        let cli = Cli::try_parse_from(["sift", "index", "/a", "/b", "--reset"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Index {
                roots: vec![PathBuf::from("/a"), PathBuf::from("/b")],
                reset: true,
                json: false,
            }
        );
    }

    #[test]
    fn test_add_folder_requires_path() {
        assert!(Cli::try_parse_from(["sift", "add-folder"]).is_err());
    }

    #[test]
    fn test_merge_roots_dedups_in_order() {
        let merged = merge_roots(
            &[PathBuf::from("/docs"), PathBuf::from("/notes")],
            &[PathBuf::from("/notes"), PathBuf::from("/code")],
        );
        assert_eq!(
            merged,
            vec![
                PathBuf::from("/docs"),
                PathBuf::from("/notes"),
                PathBuf::from("/code")
            ]
        );
    }

    #[test]
    fn test_engine_config_mapping() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/var/lib/sift");
        config.indexing.chunk_size = 400;
        config.indexing.chunk_overlap = 40;
        config.indexing.workers = 8;
        config.indexing.rebuild_on_corrupt = false;
        config.retrieval.vector_weight = 0.5;
        config.retrieval.keyword_weight = 0.5;
        config.retrieval.min_score = Some(0.2);
        config.watcher.debounce_ms = 250;

        let engine = engine_config(&config);
        assert_eq!(engine.data_dir, PathBuf::from("/var/lib/sift"));
        assert_eq!(engine.coordinator.chunk_size, 400);
        assert_eq!(engine.coordinator.chunk_overlap, 40);
        assert_eq!(engine.coordinator.workers, 8);
        assert!(!engine.rebuild_on_corrupt);
        assert_eq!(engine.retrieval.vector_weight, 0.5);
        assert_eq!(engine.retrieval.min_score, Some(0.2));
        assert_eq!(engine.watcher.debounce, Duration::from_millis(250));
        assert!(engine
            .coordinator
            .walk
            .accepts_file_name(Path::new("/docs/notes.md")));
    }

    #[test]
    fn test_summarizer_disabled_by_default() {
        assert!(summarizer(&Config::default()).is_none());
        let mut config = Config::default();
        config.summaries.enabled = true;
        assert!(summarizer(&config).is_some());
    }

    #[tokio::test]
    async fn test_stats_on_fresh_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");

        let engine = open_engine(&config).unwrap();
        let stats = engine.stats().await;
        assert_eq!(stats.tracked_file_count, 0);
        assert!(engine.roots().await.is_empty());
        assert!(ensure_roots(&engine, &[]).await.is_err());
    }
}
