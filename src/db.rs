//! SQLite connection pool setup and schema bootstrap for the operation log.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Current operation log schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Create a new database connection pool backed by a single database file.
pub async fn create_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create the operation log tables and indexes if they do not exist yet,
/// and stamp the schema version.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_info LIMIT 1")
        .fetch_optional(pool)
        .await?;
    if version.is_none() {
        sqlx::query("INSERT INTO schema_info (version) VALUES (?1)")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            modno INTEGER NOT NULL,
            instance_id TEXT NOT NULL,
            original_instance_keyid TEXT NOT NULL DEFAULT '',
            original_id INTEGER NOT NULL DEFAULT 0,
            repo_id TEXT NOT NULL DEFAULT '',
            repo_guid TEXT NOT NULL DEFAULT '',
            plan_id TEXT NOT NULL DEFAULT '',
            flow_id INTEGER NOT NULL DEFAULT 0,
            snapshot_id TEXT NOT NULL DEFAULT '',
            unix_time_start_ms INTEGER NOT NULL,
            unix_time_end_ms INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            display_message TEXT NOT NULL DEFAULT '',
            logref TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL DEFAULT '',
            payload TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_operations_flow ON operations(flow_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_operations_repo_time ON operations(repo_guid, unix_time_start_ms)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_operations_instance_modno ON operations(instance_id, modno)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_operations_snapshot ON operations(snapshot_id) WHERE snapshot_id != ''",
    )
    .execute(pool)
    .await?;

    Ok(())
}
