//! Database initialization
//!
//! Opens (or creates) the SQLite store and makes sure every table the
//! migration pipeline relies on exists. All DDL is idempotent, so running it
//! against an existing database is a no-op.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Default SQLite busy timeout. Lock contention beyond this surfaces as
/// `database is locked` and is handled by the caller's retry loop.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Parallel chunk workers each hold one connection for the duration of a
    // record's unit of work; leave headroom for the indexer and the producer.
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query(&format!("PRAGMA busy_timeout = {}", DEFAULT_BUSY_TIMEOUT_MS))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets the citation scan read while chunk workers write
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    create_tables(&pool).await?;

    Ok(pool)
}

/// Create every table owned by the migration core
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_mirror_table(pool).await?;
    create_records_table(pool).await?;
    create_pid_table(pool).await?;
    create_recid_sequence_table(pool).await?;
    create_redirect_table(pool).await?;

    info!("Database tables initialized (mirror, records, pidstore)");

    Ok(())
}

/// Create the legacy mirror table
///
/// One row per legacy numeric id. `valid` is NULL until a migration attempt
/// finishes; `marcxml` holds the zlib-compressed original bytes.
pub async fn create_mirror_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS legacy_records_mirror (
            recid INTEGER PRIMARY KEY,
            marcxml BLOB NOT NULL,
            collection TEXT,
            last_updated TEXT NOT NULL,
            valid INTEGER,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_mirror_valid ON legacy_records_mirror(valid)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the canonical records table
///
/// `revision` is the optimistic-concurrency counter: writers compare-and-swap
/// on it and bump it by one per committed change.
pub async fn create_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records_metadata (
            id TEXT PRIMARY KEY,
            json TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            created TEXT NOT NULL,
            updated TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the persistent identifier table
///
/// The (pid_type, pid_value) uniqueness constraint is what prevents two
/// concurrent writers from minting the same identifier twice.
pub async fn create_pid_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pidstore_pid (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pid_type TEXT NOT NULL,
            pid_value TEXT NOT NULL,
            object_type TEXT,
            object_uuid TEXT,
            status TEXT NOT NULL,
            created TEXT NOT NULL,
            updated TEXT NOT NULL,
            UNIQUE (pid_type, pid_value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pidstore_pid_object ON pidstore_pid(object_uuid)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the numeric id sequence
///
/// AUTOINCREMENT guarantees a minted value is above every value ever
/// inserted, including ids reserved explicitly by migrated records.
pub async fn create_recid_sequence_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pidstore_recid (
            recid INTEGER PRIMARY KEY AUTOINCREMENT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the redirect (tombstone edge) table
pub async fn create_redirect_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pidstore_redirect (
            from_uuid TEXT PRIMARY KEY,
            to_uuid TEXT NOT NULL,
            created TEXT NOT NULL,
            CHECK (from_uuid <> to_uuid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
