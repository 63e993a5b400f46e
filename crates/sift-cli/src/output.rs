//! Output formatting for command results.
//!
//! Every command prints either human-readable text or, with `--json`,
//! a single JSON document on stdout.

use std::path::PathBuf;

use serde::Serialize;
use sift_index::{FolderReport, IndexMode, IndexStats, ReconcileReport, ScoredResult};

/// Maximum characters to show in a text snippet
const SNIPPET_MAX_CHARS: usize = 200;

#[derive(Serialize)]
struct JsonResults<'a> {
    query: &'a str,
    results: &'a [ScoredResult],
}

#[derive(Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub counts: IndexStats,
    pub embedding_model: String,
    pub mode: IndexMode,
    pub roots: Vec<PathBuf>,
}

pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn format_results_json(query: &str, results: &[ScoredResult]) -> String {
    to_json(&JsonResults { query, results })
}

/// Search results, one block per chunk.
pub fn format_results_human(query: &str, results: &[ScoredResult]) -> String {
    if results.is_empty() {
        return format!("No results found for \"{}\"", query);
    }

    let mut output = format!(
        "Found {} result{} for \"{}\":\n\n",
        results.len(),
        if results.len() == 1 { "" } else { "s" },
        query
    );

    for (i, result) in results.iter().enumerate() {
        output.push_str(&format!(
            "{}. {} #{} (score: {:.2})\n",
            i + 1,
            result.source_path.display(),
            result.sequence_index,
            result.score
        ));

        let mut parts = Vec::new();
        if let Some(vs) = result.vector_score {
            parts.push(format!("semantic: {:.2}", vs));
        }
        if let Some(ks) = result.keyword_score {
            parts.push(format!("keyword: {:.2}", ks));
        }
        if !parts.is_empty() {
            output.push_str(&format!("   [{}]\n", parts.join(", ")));
        }
        if let Some(summary) = &result.summary {
            output.push_str(&format!("   Summary: {}\n", summary));
        }
        output.push_str(&format!("   {}\n\n", snippet(&result.text)));
    }

    output.trim_end().to_string()
}

/// Retrieved context for an external answering step, grouped as sources.
pub fn format_context_human(query: &str, results: &[ScoredResult]) -> String {
    if results.is_empty() {
        return format!("No context found for \"{}\"", query);
    }

    let mut output = format!("Context for \"{}\":\n", query);
    for (i, result) in results.iter().enumerate() {
        output.push_str(&format!(
            "\n[{}] {} (chunk {}, score {:.2})\n",
            i + 1,
            result.source_path.display(),
            result.sequence_index,
            result.score
        ));
        output.push_str(result.text.trim());
        output.push('\n');
    }
    output.trim_end().to_string()
}

pub fn format_reconcile(report: &ReconcileReport) -> String {
    let mut line = format!(
        "Indexed {}, skipped {}, removed {}, errors {}",
        report.indexed, report.skipped, report.removed, report.errors
    );
    if report.repaired > 0 {
        line.push_str(&format!(", repaired {}", report.repaired));
    }
    if report.summarized > 0 {
        line.push_str(&format!(", summarized {}", report.summarized));
    }
    line
}

pub fn format_folder(path: &std::path::Path, report: &FolderReport) -> String {
    format!(
        "Added {}: indexed {}, skipped {}, errors {}",
        path.display(),
        report.indexed,
        report.skipped,
        report.errors
    )
}

pub fn format_stats(report: &StatsReport) -> String {
    let mode = match report.mode {
        IndexMode::FirstRun => "first run pending",
        IndexMode::Incremental => "incremental",
    };
    let mut output = format!(
        "Tracked files:   {}\nVector chunks:   {}\nKeyword chunks:  {}\nEmbedding model: {}\nMode:            {}\n",
        report.counts.tracked_file_count,
        report.counts.vector_count,
        report.counts.keyword_count,
        report.embedding_model,
        mode
    );
    if report.roots.is_empty() {
        output.push_str("Roots:           (none)");
    } else {
        output.push_str("Roots:");
        for root in &report.roots {
            output.push_str(&format!("\n  {}", root.display()));
        }
    }
    output
}

/// Collapse whitespace and truncate at a word boundary.
fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_MAX_CHARS {
        return flat;
    }
    let truncated: String = flat.chars().take(SNIPPET_MAX_CHARS).collect();
    match truncated.rfind(' ') {
        Some(last_space) => format!("{}...", &truncated[..last_space]),
        None => format!("{}...", truncated),
    }
}
