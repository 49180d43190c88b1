//! Tests for database initialization
//!
//! Database creation on first run, idempotent re-initialization, and the
//! constraints the migration core relies on.

use bibrec_common::db::init::init_database;
use tempfile::TempDir;

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sub").join("bibrec.db");

    let pool = init_database(&db_path).await;
    assert!(pool.is_ok(), "Database initialization failed: {:?}", pool.err());
    assert!(db_path.exists(), "Database file was not created");

    let tables = table_names(&pool.unwrap()).await;
    for expected in [
        "legacy_records_mirror",
        "pidstore_pid",
        "pidstore_recid",
        "pidstore_redirect",
        "records_metadata",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("bibrec.db");

    let pool1 = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO pidstore_recid (recid) VALUES (7)")
        .execute(&pool1)
        .await
        .unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pidstore_recid")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(count, 1, "re-initialization must not drop data");
}

#[tokio::test]
async fn test_pid_uniqueness_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("bibrec.db")).await.unwrap();

    let insert = "INSERT INTO pidstore_pid (pid_type, pid_value, status, created, updated) \
                  VALUES ('lit', '1', 'registered', 'now', 'now')";
    sqlx::query(insert).execute(&pool).await.unwrap();
    let second = sqlx::query(insert).execute(&pool).await;

    match second {
        Err(sqlx::Error::Database(db_err)) => assert!(db_err.is_unique_violation()),
        other => panic!("expected unique violation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_self_redirect_rejected_by_schema() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("bibrec.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO pidstore_redirect (from_uuid, to_uuid, created) VALUES ('a', 'a', 'now')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());
}
