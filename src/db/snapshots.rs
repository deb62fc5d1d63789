use sqlx::Row;
use tracing::{debug, info, warn};

use super::{EngineError, EngineResult, SqlDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Indexing,
    Completed,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Indexing => "indexing",
            SnapshotStatus::Completed => "completed",
            SnapshotStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "indexing" => Ok(SnapshotStatus::Indexing),
            "completed" => Ok(SnapshotStatus::Completed),
            "failed" => Ok(SnapshotStatus::Failed),
            other => Err(EngineError::State(format!("unknown snapshot status {other}"))),
        }
    }
}

/// Create an `indexing` snapshot for `repo_id` at `commit_hash`.
///
/// Returns `(None, false)` when another snapshot of the repository is still
/// `indexing` (the advisory lock), and `(Some(existing), false)` when
/// `force_new` is off and a completed snapshot already covers the commit.
pub async fn create_snapshot(
    db: &SqlDb,
    repo_id: i64,
    commit_hash: &str,
    force_new: bool,
) -> EngineResult<(Option<i64>, bool)> {
    if !force_new {
        let existing = sqlx::query(
            "SELECT id FROM snapshots \
             WHERE repository_id = ? AND commit_hash = ? AND status = 'completed'",
        )
        .bind(repo_id)
        .bind(commit_hash)
        .fetch_optional(db.as_ref())
        .await?;
        if let Some(row) = existing {
            let id: i64 = row.get("id");
            debug!(repo_id, commit_hash, id, "reusing completed snapshot");
            return Ok((Some(id), false));
        }
    }

    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
    let inserted = sqlx::query(
        "INSERT INTO snapshots (repository_id, commit_hash, status, created_at) \
         VALUES (?, ?, 'indexing', ?)",
    )
    .bind(repo_id)
    .bind(commit_hash)
    .bind(&now)
    .execute(db.as_ref())
    .await;

    match inserted {
        Ok(result) => Ok((Some(result.last_insert_rowid()), true)),
        Err(sqlx::Error::Database(db_err))
            if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
        {
            warn!(repo_id, commit_hash, "another snapshot is indexing, yielding");
            Ok((None, false))
        }
        Err(err) => Err(err.into()),
    }
}

/// Atomically complete a snapshot: point the repository at it, prune any
/// completed snapshot of the same commit it supersedes (the `--force`
/// path), and flip the status, all in one transaction. The pointer update
/// is a compare-and-set guarded by snapshot creation time, so a stale
/// activation loses with `Conflict` instead of overwriting a newer winner.
///
/// Returns the ids of pruned snapshots so the caller can drop their
/// search documents.
pub async fn activate_snapshot(
    db: &SqlDb,
    repo_id: i64,
    snapshot_id: i64,
    stats: &serde_json::Value,
    manifest: &serde_json::Value,
) -> EngineResult<Vec<i64>> {
    let mut tx = db.begin().await?;

    let pointed = sqlx::query(
        "UPDATE repositories SET current_snapshot_id = ? \
         WHERE id = ? AND ( \
             current_snapshot_id IS NULL \
             OR current_snapshot_id = ? \
             OR (SELECT created_at FROM snapshots WHERE id = repositories.current_snapshot_id) \
                <= (SELECT created_at FROM snapshots WHERE id = ?) \
         )",
    )
    .bind(snapshot_id)
    .bind(repo_id)
    .bind(snapshot_id)
    .bind(snapshot_id)
    .execute(&mut *tx)
    .await?;

    if pointed.rows_affected() == 0 {
        return Err(EngineError::Conflict(format!(
            "a newer snapshot already activated for repository {repo_id}"
        )));
    }

    // A forced re-index of an already-indexed commit supersedes the old
    // snapshot; only one completed snapshot per commit may exist.
    let pruned_rows = sqlx::query(
        "SELECT id FROM snapshots WHERE repository_id = ? AND status = 'completed' \
         AND commit_hash = (SELECT commit_hash FROM snapshots WHERE id = ?) AND id != ?",
    )
    .bind(repo_id)
    .bind(snapshot_id)
    .bind(snapshot_id)
    .fetch_all(&mut *tx)
    .await?;
    let pruned: Vec<i64> = pruned_rows.iter().map(|row| row.get("id")).collect();
    for stale in &pruned {
        sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(stale)
            .execute(&mut *tx)
            .await?;
    }

    let flipped = sqlx::query(
        "UPDATE snapshots SET status = 'completed', stats = ?, manifest = ? \
         WHERE id = ? AND repository_id = ? AND status = 'indexing'",
    )
    .bind(stats.to_string())
    .bind(manifest.to_string())
    .bind(snapshot_id)
    .bind(repo_id)
    .execute(&mut *tx)
    .await?;

    if flipped.rows_affected() == 0 {
        return Err(EngineError::State(format!(
            "snapshot {snapshot_id} is not in the indexing state"
        )));
    }

    tx.commit().await?;
    info!(repo_id, snapshot_id, pruned = pruned.len(), "snapshot activated");
    Ok(pruned)
}

/// Transition a snapshot to `failed`, recording the error. The active
/// pointer is never touched.
pub async fn fail_snapshot(db: &SqlDb, snapshot_id: i64, error: &str) -> EngineResult<()> {
    let result = sqlx::query(
        "UPDATE snapshots SET status = 'failed', error = ? \
         WHERE id = ? AND status = 'indexing'",
    )
    .bind(error)
    .bind(snapshot_id)
    .execute(db.as_ref())
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::State(format!(
            "snapshot {snapshot_id} is not in the indexing state"
        )));
    }
    warn!(snapshot_id, error, "snapshot failed");
    Ok(())
}

pub async fn snapshot_status(db: &SqlDb, snapshot_id: i64) -> EngineResult<SnapshotStatus> {
    let row = sqlx::query("SELECT status FROM snapshots WHERE id = ?")
        .bind(snapshot_id)
        .fetch_optional(db.as_ref())
        .await?
        .ok_or_else(|| EngineError::Usage(format!("unknown snapshot {snapshot_id}")))?;
    SnapshotStatus::parse(row.get("status"))
}

pub async fn snapshot_manifest(db: &SqlDb, snapshot_id: i64) -> EngineResult<serde_json::Value> {
    let row = sqlx::query("SELECT manifest FROM snapshots WHERE id = ?")
        .bind(snapshot_id)
        .fetch_optional(db.as_ref())
        .await?
        .ok_or_else(|| EngineError::Usage(format!("unknown snapshot {snapshot_id}")))?;
    let manifest: Option<String> = row.get("manifest");
    match manifest {
        Some(text) => Ok(serde_json::from_str(&text).map_err(anyhow::Error::from)?),
        None => Ok(serde_json::Value::Null),
    }
}

pub async fn snapshot_stats(db: &SqlDb, snapshot_id: i64) -> EngineResult<serde_json::Value> {
    let row = sqlx::query("SELECT stats FROM snapshots WHERE id = ?")
        .bind(snapshot_id)
        .fetch_optional(db.as_ref())
        .await?
        .ok_or_else(|| EngineError::Usage(format!("unknown snapshot {snapshot_id}")))?;
    let stats: Option<String> = row.get("stats");
    match stats {
        Some(text) => Ok(serde_json::from_str(&text).map_err(anyhow::Error::from)?),
        None => Ok(serde_json::Value::Null),
    }
}

/// Drop a snapshot and everything it owns. The active snapshot of a
/// repository cannot be deleted; repoint or fail it first.
pub async fn delete_snapshot(db: &SqlDb, snapshot_id: i64) -> EngineResult<()> {
    let active = sqlx::query("SELECT id FROM repositories WHERE current_snapshot_id = ?")
        .bind(snapshot_id)
        .fetch_optional(db.as_ref())
        .await?;
    if active.is_some() {
        return Err(EngineError::Usage(format!(
            "snapshot {snapshot_id} is active; activate another snapshot before deleting it"
        )));
    }
    sqlx::query("DELETE FROM snapshots WHERE id = ?")
        .bind(snapshot_id)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

/// Remove content rows nothing references any more. Contents are globally
/// deduplicated, so this runs across all snapshots.
pub async fn garbage_collect_contents(db: &SqlDb) -> EngineResult<u64> {
    let result = sqlx::query(
        "DELETE FROM contents WHERE hash NOT IN (SELECT content_hash FROM chunks) \
         AND hash NOT IN (SELECT content_hash FROM files WHERE content_hash IS NOT NULL)",
    )
    .execute(db.as_ref())
    .await?;
    Ok(result.rows_affected())
}
