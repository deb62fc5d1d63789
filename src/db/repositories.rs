use sqlx::Row;
use tracing::debug;

use super::{EngineError, EngineResult, SqlDb};

/// Create the repository row if it does not exist yet and return its id.
/// Safe to call concurrently; `(remote_url, branch)` is unique.
pub async fn ensure_repository(
    db: &SqlDb,
    url: &str,
    branch: &str,
    name: &str,
) -> EngineResult<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO repositories (remote_url, branch, display_name, created_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (remote_url, branch) DO NOTHING",
    )
    .bind(url)
    .bind(branch)
    .bind(name)
    .bind(&now)
    .execute(db.as_ref())
    .await?;

    let row = sqlx::query("SELECT id FROM repositories WHERE remote_url = ? AND branch = ?")
        .bind(url)
        .bind(branch)
        .fetch_one(db.as_ref())
        .await?;
    let id: i64 = row.get("id");
    debug!(url, branch, id, "repository ensured");
    Ok(id)
}

pub async fn repository_by_url(db: &SqlDb, url: &str, branch: &str) -> EngineResult<i64> {
    let row = sqlx::query("SELECT id FROM repositories WHERE remote_url = ? AND branch = ?")
        .bind(url)
        .bind(branch)
        .fetch_optional(db.as_ref())
        .await?;
    match row {
        Some(row) => Ok(row.get("id")),
        None => Err(EngineError::Usage(format!(
            "unknown repository {} ({})",
            url, branch
        ))),
    }
}

/// The currently active snapshot of a repository, if any. Never returns a
/// snapshot that is still `indexing`.
pub async fn active_snapshot_of(db: &SqlDb, repo_id: i64) -> EngineResult<Option<i64>> {
    let row = sqlx::query(
        "SELECT s.id FROM repositories r \
         JOIN snapshots s ON s.id = r.current_snapshot_id \
         WHERE r.id = ? AND s.status = 'completed'",
    )
    .bind(repo_id)
    .fetch_optional(db.as_ref())
    .await?;
    Ok(row.map(|r| r.get("id")))
}
