use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Repository identifier: the remote URL plus the branch being indexed.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub url: String,
    pub branch: String,
}

impl RepoRef {
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
        }
    }

    /// Stable directory name for this repository under the repo volume.
    pub fn disk_digest(&self) -> String {
        blake3::hash(self.url.as_bytes()).to_hex()[..16].to_owned()
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.url, self.branch)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Source,
    Test,
    Config,
    Docs,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Source => "source",
            FileCategory::Test => "test",
            FileCategory::Config => "config",
            FileCategory::Docs => "docs",
        }
    }
}

/// One file surviving the collector funnel.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Repo-relative, POSIX-normalized
    pub rel_path: String,
    pub full_path: PathBuf,
    pub extension: Option<String>,
    pub size: u64,
    /// Git blob SHA-1; absent for untracked files
    pub git_hash: Option<String>,
    pub category: FileCategory,
}

impl FileDescriptor {
    pub fn is_tracked(&self) -> bool {
        self.git_hash.is_some()
    }
}
