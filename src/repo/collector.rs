use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use relative_path::RelativePath;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::db::EngineResult;

use super::types::{FileCategory, FileDescriptor};

/// Extensions the index accepts at all.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "js", "jsx", "ts", "tsx", "java", "go", "rs", "c", "cc", "cpp", "h", "hpp", "cs",
    "php", "rb", "kt", "scala", "vue", "svelte", "css", "scss", "html", "json", "yaml", "yml",
    "toml", "xml", "sql", "md", "rst",
];

/// Any file under one of these path components is skipped regardless of
/// extension.
pub const BLOCKED_COMPONENTS: &[&str] = &[
    ".git", ".svn", ".hg", ".idea", ".vscode", "node_modules", "venv", ".venv", "env", "dist",
    "build", "target", "out", "bin", "__pycache__", "coverage", ".pytest_cache", "vendor",
    "third_party",
];

const CONFIG_FILENAMES: &[&str] = &["package.json", "pyproject.toml", "Dockerfile", "Makefile"];

/// A candidate that passed the metadata filter; no filesystem I/O has
/// happened for it yet.
#[derive(Debug, Clone)]
struct Candidate {
    rel_path: String,
    extension: Option<String>,
    git_hash: Option<String>,
}

/// Streams classified file descriptors out of a git working tree. The git
/// object index is the authoritative file list, so ignore rules cost
/// nothing. Single pass; the stream is not restartable.
pub struct GitCollector {
    repo_root: PathBuf,
    max_file_size: u64,
}

impl GitCollector {
    pub fn new(repo_root: impl AsRef<Path>, max_file_size: u64) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_owned(),
            max_file_size,
        }
    }

    /// Enumerate and pre-filter the worktree, returning the lazy batch
    /// stream. Stages 1 and 2 of the funnel run here (git + string checks
    /// only); the per-file `lstat` and classification run as batches are
    /// pulled.
    pub async fn stream_files(&self, batch_size: usize) -> EngineResult<FileBatches> {
        let tracked = self
            .git_stdout(&["ls-files", "-s", "-z"])
            .await
            .context("git ls-files failed")?;
        let untracked = self
            .git_stdout(&["ls-files", "--others", "--exclude-standard", "-z"])
            .await
            .context("git ls-files --others failed")?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for entry in tracked.split('\0').filter(|e| !e.is_empty()) {
            let Some((header, path)) = entry.split_once('\t') else {
                continue;
            };
            let git_hash = header.split_whitespace().nth(1).map(str::to_owned);
            if let Some(candidate) = metadata_filter(path, git_hash) {
                // merge stages repeat a path; the first entry wins
                if seen.insert(candidate.rel_path.clone()) {
                    candidates.push(candidate);
                }
            }
        }

        // Tracked wins when both forms of a path appear.
        for path in untracked.split('\0').filter(|e| !e.is_empty()) {
            if let Some(candidate) = metadata_filter(path, None) {
                if seen.insert(candidate.rel_path.clone()) {
                    candidates.push(candidate);
                }
            }
        }

        debug!(
            candidates = candidates.len(),
            root = %self.repo_root.display(),
            "collector enumeration complete"
        );

        Ok(FileBatches {
            repo_root: self.repo_root.clone(),
            max_file_size: self.max_file_size,
            candidates: candidates.into_iter().collect(),
            batch_size: batch_size.max(1),
        })
    }

    async fn git_stdout(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|err| anyhow!("failed to spawn git {}: {err}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Stage 2: allow-listed extension, no blocked path component. Pure string
/// work; candidates that fail disappear before any filesystem access.
fn metadata_filter(path: &str, git_hash: Option<String>) -> Option<Candidate> {
    let normalized = RelativePath::new(path).normalize();
    let rel_path = normalized.as_str().to_owned();
    if rel_path.is_empty() {
        return None;
    }

    let extension = normalized.extension().map(str::to_lowercase);
    match &extension {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
        _ => return None,
    }

    if rel_path
        .split('/')
        .any(|component| BLOCKED_COMPONENTS.contains(&component))
    {
        return None;
    }

    Some(Candidate {
        rel_path,
        extension,
        git_hash,
    })
}

/// The lazy batch stream: each `next()` runs the safety filter and
/// classification for up to `batch_size` surviving files.
pub struct FileBatches {
    repo_root: PathBuf,
    max_file_size: u64,
    candidates: std::collections::VecDeque<Candidate>,
    batch_size: usize,
}

impl Iterator for FileBatches {
    type Item = Vec<FileDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(candidate) = self.candidates.pop_front() else {
                break;
            };
            let full_path = self.repo_root.join(&candidate.rel_path);

            // Stage 3: one lstat; reject symlinks, non-regular files,
            // empty files, and anything over the size cap.
            let metadata = match std::fs::symlink_metadata(&full_path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %candidate.rel_path, %err, "lstat failed, dropping file");
                    continue;
                }
            };
            if !metadata.is_file() || metadata.file_type().is_symlink() {
                continue;
            }
            let size = metadata.len();
            if size == 0 || size > self.max_file_size {
                continue;
            }

            let category = classify(&candidate.rel_path, candidate.extension.as_deref());
            batch.push(FileDescriptor {
                rel_path: candidate.rel_path,
                full_path,
                extension: candidate.extension,
                size,
                git_hash: candidate.git_hash,
                category,
            });
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Stage 4: category by path heuristics, in precedence order
/// docs > test > config > source.
pub fn classify(rel_path: &str, extension: Option<&str>) -> FileCategory {
    let components: Vec<&str> = rel_path.split('/').collect();
    let filename = components.last().copied().unwrap_or(rel_path);
    let dirs = &components[..components.len().saturating_sub(1)];

    if dirs.iter().any(|d| *d == "docs" || *d == "documentation")
        || matches!(extension, Some("md") | Some("rst"))
    {
        return FileCategory::Docs;
    }

    let test_dir = dirs
        .iter()
        .any(|d| *d == "tests" || *d == "__tests__" || *d == "spec");
    let stem = filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename);
    let test_name = filename.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with(".spec")
        || filename.contains(".spec.");
    if test_dir || test_name {
        return FileCategory::Test;
    }

    if CONFIG_FILENAMES.contains(&filename)
        || matches!(extension, Some("yml") | Some("yaml") | Some("toml"))
    {
        return FileCategory::Config;
    }

    FileCategory::Source
}
