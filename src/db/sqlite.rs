use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use super::EngineResult;

pub type SqlDb = Arc<SqlitePool>;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if necessary) the database at `db_url` and bring the
/// schema up to date.
pub async fn init_sqlite_db(db_url: &str, max_connections: u32) -> EngineResult<SqlDb> {
    let options = SqliteConnectOptions::from_str(db_url)
        .context("invalid database url")?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await.context("migrations failed")?;
    debug!(%db_url, "database ready");

    Ok(Arc::new(pool))
}

/// Apply pending migrations only; the `db upgrade` entry point.
pub async fn upgrade(db_url: &str) -> EngineResult<()> {
    let db = init_sqlite_db(db_url, 1).await?;
    db.close().await;
    Ok(())
}
