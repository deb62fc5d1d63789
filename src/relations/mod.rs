use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::db::graph::CrossFileRelation;
use crate::db::EngineResult;

/// A pluggable producer of cross-file relations for one worktree. The
/// extractor is advisory: when a source is missing or fails, indexing
/// proceeds without cross-file edges.
#[async_trait]
pub trait RelationSource: Send + Sync {
    fn name(&self) -> &str;

    async fn relations(&self, worktree: &Path) -> EngineResult<Vec<CrossFileRelation>>;
}

/// Reads the JSON-lines relation feed format:
/// one `CrossFileRelation` object per line.
pub struct JsonlRelationFeed {
    feed_path: PathBuf,
}

impl JsonlRelationFeed {
    pub fn new(feed_path: impl Into<PathBuf>) -> Self {
        Self {
            feed_path: feed_path.into(),
        }
    }

    fn parse_lines(&self, raw: &str) -> Vec<CrossFileRelation> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(row) => Some(row),
                Err(err) => {
                    warn!(%err, "malformed relation row, dropping");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl RelationSource for JsonlRelationFeed {
    fn name(&self) -> &str {
        "jsonl-feed"
    }

    async fn relations(&self, worktree: &Path) -> EngineResult<Vec<CrossFileRelation>> {
        let path = if self.feed_path.is_absolute() {
            self.feed_path.clone()
        } else {
            worktree.join(&self.feed_path)
        };
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read relation feed {}", path.display()))?;
        Ok(self.parse_lines(&raw))
    }
}

/// Runs an external relation indexer and parses its JSON-lines stdout.
/// The command is invoked with the worktree as its working directory.
pub struct CommandRelationFeed {
    program: String,
    args: Vec<String>,
}

impl CommandRelationFeed {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RelationSource for CommandRelationFeed {
    fn name(&self) -> &str {
        &self.program
    }

    async fn relations(&self, worktree: &Path) -> EngineResult<Vec<CrossFileRelation>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(worktree)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )
            .into());
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        Ok(JsonlRelationFeed::new("unused").parse_lines(&raw))
    }
}
