use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::EngineResult;

use super::types::RepoRef;

/// Manages the on-disk layout `<volume>/<digest>/{mirror, worktrees/<id>}`.
/// Mirror updates happen under a per-repository mutex; worktrees are
/// per-snapshot and never shared.
pub struct RepoManager {
    volume: PathBuf,
    locks: scc::HashMap<String, Arc<Mutex<()>>>,
}

impl RepoManager {
    pub fn new(volume: PathBuf) -> Self {
        Self {
            volume,
            locks: scc::HashMap::new(),
        }
    }

    fn lock_for(&self, repo: &RepoRef) -> Arc<Mutex<()>> {
        let digest = repo.disk_digest();
        if let Some(existing) = self.locks.read(&digest, |_, v| v.clone()) {
            return existing;
        }
        let lock = Arc::new(Mutex::new(()));
        match self.locks.insert(digest, lock.clone()) {
            Ok(()) => lock,
            // lost the race; take the winner's
            Err((key, _)) => self.locks.read(&key, |_, v| v.clone()).unwrap_or(lock),
        }
    }

    pub fn mirror_dir(&self, repo: &RepoRef) -> PathBuf {
        self.volume.join(repo.disk_digest()).join("mirror")
    }

    pub fn worktree_dir(&self, repo: &RepoRef, snapshot_id: i64) -> PathBuf {
        self.volume
            .join(repo.disk_digest())
            .join("worktrees")
            .join(snapshot_id.to_string())
    }

    /// Clone the bare mirror on first contact, fetch afterwards. Returns the
    /// mirror path.
    pub async fn update_mirror(&self, repo: &RepoRef) -> EngineResult<PathBuf> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        let mirror = self.mirror_dir(repo);
        if mirror.join("HEAD").exists() {
            debug!(url = %repo.url, "updating mirror");
            run_git(&["-C", path_str(&mirror)?, "remote", "update", "--prune"]).await?;
        } else {
            info!(url = %repo.url, "cloning mirror");
            if let Some(parent) = mirror.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("failed to create repo volume")?;
            }
            run_git(&["clone", "--mirror", &repo.url, path_str(&mirror)?]).await?;
        }
        Ok(mirror)
    }

    /// Resolve the branch tip to a commit hash in the mirror.
    pub async fn resolve_commit(&self, repo: &RepoRef) -> EngineResult<String> {
        let mirror = self.mirror_dir(repo);
        let commit = run_git(&[
            "-C",
            path_str(&mirror)?,
            "rev-parse",
            &format!("{}^{{commit}}", repo.branch),
        ])
        .await?;
        Ok(commit.trim().to_owned())
    }

    /// Check out an ephemeral worktree for one snapshot.
    pub async fn create_worktree(
        &self,
        repo: &RepoRef,
        commit_hash: &str,
        snapshot_id: i64,
    ) -> EngineResult<PathBuf> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        let mirror = self.mirror_dir(repo);
        let worktree = self.worktree_dir(repo, snapshot_id);
        if worktree.exists() {
            return Ok(worktree);
        }
        if let Some(parent) = worktree.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create worktrees dir")?;
        }
        run_git(&[
            "-C",
            path_str(&mirror)?,
            "worktree",
            "add",
            "--detach",
            path_str(&worktree)?,
            commit_hash,
        ])
        .await?;
        Ok(worktree)
    }

    /// Drop a snapshot's worktree; best effort, the mirror stays.
    pub async fn remove_worktree(&self, repo: &RepoRef, snapshot_id: i64) -> EngineResult<()> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        let mirror = self.mirror_dir(repo);
        let worktree = self.worktree_dir(repo, snapshot_id);
        if !worktree.exists() {
            return Ok(());
        }
        run_git(&[
            "-C",
            path_str(&mirror)?,
            "worktree",
            "remove",
            "--force",
            path_str(&worktree)?,
        ])
        .await?;
        Ok(())
    }
}

fn path_str(path: &PathBuf) -> EngineResult<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()).into())
}

async fn run_git(args: &[&str]) -> EngineResult<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|err| anyhow!("failed to spawn git {}: {err}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
