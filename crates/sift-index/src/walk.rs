//! File enumeration policy shared by reconcile and the watcher.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

/// Extensions indexed by default: text, code, markup, config and documents.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    // text
    "txt", "md", "markdown", "rst", "log", "tex", "bib", "csv", "tsv",
    // code
    "py", "js", "ts", "jsx", "tsx", "java", "c", "cpp", "h", "hpp", "cs", "go", "rs", "rb",
    "php", "swift", "kt", "scala", "r", "sql", "sh", "bash", "zsh", "ps1", "lua", "pl",
    // markup
    "html", "htm", "css", "xml", "svg",
    // config
    "json", "yaml", "yml", "toml", "ini", "cfg", "conf",
    // documents
    "pdf", "docx", "pptx", "xlsx", "xls",
];

/// Directory names never descended into.
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git", "__pycache__", "node_modules", "venv", ".venv", "env", "dist", "build", ".cache",
    ".pytest_cache", ".mypy_cache", ".idea", ".vscode", ".vs", "bin", "obj", "target",
];

/// File names never indexed.
pub const DEFAULT_IGNORE_FILES: &[&str] = &[".DS_Store", "Thumbs.db", ".gitignore", ".gitattributes"];

/// Which files under a root are eligible for indexing.
#[derive(Debug, Clone)]
pub struct WalkPolicy {
    extensions: HashSet<String>,
    ignore_dirs: HashSet<String>,
    ignore_files: HashSet<String>,
    respect_gitignore: bool,
}

impl Default for WalkPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()),
            DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()),
            DEFAULT_IGNORE_FILES.iter().map(|s| s.to_string()),
        )
    }
}

impl WalkPolicy {
    pub fn new(
        extensions: impl IntoIterator<Item = String>,
        ignore_dirs: impl IntoIterator<Item = String>,
        ignore_files: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ignore_dirs: ignore_dirs.into_iter().collect(),
            ignore_files: ignore_files.into_iter().collect(),
            respect_gitignore: true,
        }
    }

    pub fn with_gitignore(mut self, respect: bool) -> Self {
        self.respect_gitignore = respect;
        self
    }

    /// Check the file name and extension of `path`.
    pub fn accepts_file_name(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') || self.ignore_files.contains(name) {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Check a path observed under `root`, including every directory between
    /// the root and the file.
    pub fn accepts(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let mut components: Vec<Component<'_>> = relative.components().collect();
        components.pop();
        let dirs_ok = components.iter().all(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .map(|n| !self.is_ignored_dir(n))
                .unwrap_or(false),
            _ => false,
        });
        dirs_ok && self.accepts_file_name(path)
    }

    fn is_ignored_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.ignore_dirs.contains(name)
    }

    /// Enumerate eligible files under all `roots`, sorted and deduplicated.
    pub fn collect(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for root in roots {
            if root.is_file() {
                if self.accepts_file_name(root) {
                    files.push(root.clone());
                }
                continue;
            }

            let ignore_dirs = self.ignore_dirs.clone();
            let walker = WalkBuilder::new(root)
                .hidden(true)
                .git_ignore(self.respect_gitignore)
                .git_global(false)
                .git_exclude(self.respect_gitignore)
                .follow_links(false)
                .filter_entry(move |entry| {
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    entry.depth() == 0
                        || !is_dir
                        || entry
                            .file_name()
                            .to_str()
                            .map(|n| !ignore_dirs.contains(n))
                            .unwrap_or(false)
                })
                .build();

            for entry in walker.filter_map(|e| e.ok()) {
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                if is_file && self.accepts_file_name(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        }

        files.sort();
        files.dedup();
        debug!("Enumerated {} files under {} roots", files.len(), roots.len());
        files
    }
}
