use sqlx::Row;
use tracing::debug;

use super::{EngineError, EngineResult, SqlDb};

/// Everything needed to build one chunk's embedding prompt.
#[derive(Debug, Clone)]
pub struct UnembeddedChunk {
    pub chunk_id: i64,
    pub file_id: i64,
    pub snapshot_id: i64,
    pub rel_path: String,
    pub language: Option<String>,
    pub category: String,
    pub metadata: serde_json::Value,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct StagingRow {
    pub chunk_id: i64,
    pub model: String,
    pub snapshot_id: i64,
    pub file_id: i64,
    pub vector_hash: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct StagingDelta {
    pub chunk_id: i64,
    pub prompt: String,
}

/// Claim the single-writer slot for `(snapshot, model)`. A second caller
/// gets `Conflict` until the first run finishes.
pub async fn begin_embedding_run(db: &SqlDb, snapshot_id: i64, model: &str) -> EngineResult<()> {
    let result = sqlx::query(
        "INSERT INTO embedding_runs (snapshot_id, model, started_at) VALUES (?, ?, ?)",
    )
    .bind(snapshot_id)
    .bind(model)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(db.as_ref())
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err))
            if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
        {
            Err(EngineError::Conflict(format!(
                "an embedding run is already in flight for snapshot {snapshot_id}"
            )))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn finish_embedding_run(db: &SqlDb, snapshot_id: i64, model: &str) -> EngineResult<()> {
    sqlx::query("DELETE FROM embedding_runs WHERE snapshot_id = ? AND model = ?")
        .bind(snapshot_id)
        .bind(model)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

/// Reset the staging rows of `(snapshot, model)` to a clean slate.
pub async fn prepare_staging(db: &SqlDb, snapshot_id: i64, model: &str) -> EngineResult<()> {
    sqlx::query("DELETE FROM embedding_staging WHERE snapshot_id = ? AND model = ?")
        .bind(snapshot_id)
        .bind(model)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

/// Page through chunks of the snapshot that have no embedding for `model`
/// yet, in chunk-id order. Keyset pagination: pass the last seen chunk id.
pub async fn fetch_unembedded(
    db: &SqlDb,
    snapshot_id: i64,
    model: &str,
    after_chunk_id: i64,
    limit: i64,
) -> EngineResult<Vec<UnembeddedChunk>> {
    let rows = sqlx::query(
        "SELECT c.id AS chunk_id, c.file_id, f.snapshot_id, f.rel_path, f.language, \
         f.category, c.metadata, ct.text \
         FROM chunks c \
         JOIN files f ON f.id = c.file_id \
         JOIN contents ct ON ct.hash = c.content_hash \
         WHERE f.snapshot_id = ? AND c.id > ? \
         AND NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.chunk_id = c.id AND e.model = ?) \
         ORDER BY c.id LIMIT ?",
    )
    .bind(snapshot_id)
    .bind(after_chunk_id)
    .bind(model)
    .bind(limit)
    .fetch_all(db.as_ref())
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let metadata: String = row.get("metadata");
            UnembeddedChunk {
                chunk_id: row.get("chunk_id"),
                file_id: row.get("file_id"),
                snapshot_id: row.get("snapshot_id"),
                rel_path: row.get("rel_path"),
                language: row.get("language"),
                category: row.get("category"),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                text: row.get("text"),
            }
        })
        .collect())
}

pub async fn bulk_load_staging(db: &SqlDb, rows: &[StagingRow]) -> EngineResult<()> {
    let mut tx = db.begin().await?;
    for row in rows {
        sqlx::query(
            "INSERT INTO embedding_staging \
             (chunk_id, model, snapshot_id, file_id, vector_hash, prompt) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (chunk_id, model) DO UPDATE SET \
             vector_hash = excluded.vector_hash, prompt = excluded.prompt, \
             vector = NULL, errored = 0",
        )
        .bind(row.chunk_id)
        .bind(&row.model)
        .bind(row.snapshot_id)
        .bind(row.file_id)
        .bind(&row.vector_hash)
        .bind(&row.prompt)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Backfill staged rows whose prompt hash already has a vector in the
/// permanent table; the dedup across files and snapshots.
pub async fn copy_cached_vectors(db: &SqlDb, snapshot_id: i64, model: &str) -> EngineResult<u64> {
    let result = sqlx::query(
        "UPDATE embedding_staging SET vector = (\
             SELECT e.vector FROM embeddings e \
             WHERE e.vector_hash = embedding_staging.vector_hash AND e.model = embedding_staging.model \
             LIMIT 1\
         ) \
         WHERE snapshot_id = ? AND model = ? AND vector IS NULL \
         AND EXISTS (\
             SELECT 1 FROM embeddings e \
             WHERE e.vector_hash = embedding_staging.vector_hash AND e.model = embedding_staging.model\
         )",
    )
    .bind(snapshot_id)
    .bind(model)
    .execute(db.as_ref())
    .await?;
    debug!(snapshot_id, copied = result.rows_affected(), "cached vectors backfilled");
    Ok(result.rows_affected())
}

/// Staged rows still without a vector, excluding ones that already errored.
pub async fn fetch_staging_delta(
    db: &SqlDb,
    snapshot_id: i64,
    model: &str,
    limit: i64,
) -> EngineResult<Vec<StagingDelta>> {
    let rows = sqlx::query(
        "SELECT chunk_id, prompt FROM embedding_staging \
         WHERE snapshot_id = ? AND model = ? AND vector IS NULL AND errored = 0 \
         ORDER BY chunk_id LIMIT ?",
    )
    .bind(snapshot_id)
    .bind(model)
    .bind(limit)
    .fetch_all(db.as_ref())
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| StagingDelta {
            chunk_id: row.get("chunk_id"),
            prompt: row.get("prompt"),
        })
        .collect())
}

pub async fn count_staging_delta(db: &SqlDb, snapshot_id: i64, model: &str) -> EngineResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM embedding_staging \
         WHERE snapshot_id = ? AND model = ? AND vector IS NULL AND errored = 0",
    )
    .bind(snapshot_id)
    .bind(model)
    .fetch_one(db.as_ref())
    .await?;
    Ok(row.get("n"))
}

pub async fn write_vectors(
    db: &SqlDb,
    model: &str,
    records: &[(i64, Vec<u8>)],
) -> EngineResult<()> {
    let mut tx = db.begin().await?;
    for (chunk_id, vector) in records {
        sqlx::query(
            "UPDATE embedding_staging SET vector = ? WHERE chunk_id = ? AND model = ?",
        )
        .bind(vector.as_slice())
        .bind(chunk_id)
        .bind(model)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn mark_errored(db: &SqlDb, model: &str, chunk_ids: &[i64]) -> EngineResult<()> {
    let mut tx = db.begin().await?;
    for chunk_id in chunk_ids {
        sqlx::query("UPDATE embedding_staging SET errored = 1 WHERE chunk_id = ? AND model = ?")
            .bind(chunk_id)
            .bind(model)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Move staged vectors into the permanent table and clear staging. The
/// insert re-derives the denormalized snapshot/file columns through the
/// chunk's owning file, so a staged row that disagrees never lands.
pub async fn promote_staging(
    db: &SqlDb,
    snapshot_id: i64,
    model: &str,
) -> EngineResult<(u64, u64)> {
    let mut tx = db.begin().await?;

    let promoted = sqlx::query(
        "INSERT INTO embeddings (chunk_id, model, snapshot_id, file_id, vector, vector_hash) \
         SELECT s.chunk_id, s.model, s.snapshot_id, s.file_id, s.vector, s.vector_hash \
         FROM embedding_staging s \
         JOIN chunks c ON c.id = s.chunk_id \
         JOIN files f ON f.id = c.file_id \
         WHERE s.snapshot_id = ? AND s.model = ? AND s.vector IS NOT NULL \
         AND c.file_id = s.file_id AND f.snapshot_id = s.snapshot_id \
         ON CONFLICT (chunk_id, model) DO UPDATE SET \
         vector = excluded.vector, vector_hash = excluded.vector_hash, \
         snapshot_id = excluded.snapshot_id, file_id = excluded.file_id",
    )
    .bind(snapshot_id)
    .bind(model)
    .execute(&mut *tx)
    .await?;

    let errored = sqlx::query(
        "SELECT COUNT(*) AS n FROM embedding_staging \
         WHERE snapshot_id = ? AND model = ? AND errored = 1",
    )
    .bind(snapshot_id)
    .bind(model)
    .fetch_one(&mut *tx)
    .await?;
    let errored: i64 = errored.get("n");

    sqlx::query("DELETE FROM embedding_staging WHERE snapshot_id = ? AND model = ?")
        .bind(snapshot_id)
        .bind(model)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok((promoted.rows_affected(), errored as u64))
}
