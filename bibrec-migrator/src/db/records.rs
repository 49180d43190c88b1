//! Canonical record storage
//!
//! Writes are compare-and-swap on `revision`: a replace only lands when the
//! stored revision is still the one the caller loaded.

use super::parse_uuid;
use bibrec_common::{CanonicalRecord, RecordJson, Result};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Insert a new record at revision 1
pub async fn insert(conn: &mut SqliteConnection, id: Uuid, json: &RecordJson) -> Result<CanonicalRecord> {
    let now = Utc::now();
    let encoded = serde_json::to_string(json)?;

    sqlx::query(
        r#"
        INSERT INTO records_metadata (id, json, revision, created, updated)
        VALUES (?, ?, 1, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(encoded)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(CanonicalRecord {
        id,
        revision: 1,
        json: json.clone(),
        created: now,
        updated: now,
    })
}

pub async fn load(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<CanonicalRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, json, revision, created, updated
        FROM records_metadata
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let id_str: String = row.get("id");
            let json_str: String = row.get("json");

            Ok(Some(CanonicalRecord {
                id: parse_uuid(&id_str)?,
                revision: row.get("revision"),
                json: serde_json::from_str(&json_str)?,
                created: row.get("created"),
                updated: row.get("updated"),
            }))
        }
        None => Ok(None),
    }
}

/// Replace the content of `current`, producing the next revision
///
/// Returns `None` when the stored revision moved on since `current` was
/// loaded; nothing is written in that case.
pub async fn replace(
    conn: &mut SqliteConnection,
    current: &CanonicalRecord,
    json: RecordJson,
) -> Result<Option<CanonicalRecord>> {
    let now = Utc::now();
    let encoded = serde_json::to_string(&json)?;

    let result = sqlx::query(
        r#"
        UPDATE records_metadata
        SET json = ?, revision = revision + 1, updated = ?
        WHERE id = ? AND revision = ?
        "#,
    )
    .bind(encoded)
    .bind(now)
    .bind(current.id.to_string())
    .bind(current.revision)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    Ok(Some(CanonicalRecord {
        id: current.id,
        revision: current.revision + 1,
        json,
        created: current.created,
        updated: now,
    }))
}

pub async fn count(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM records_metadata")
        .fetch_one(&mut *conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use serde_json::json;

    fn doc(title: &str) -> RecordJson {
        match json!({"titles": [{"title": title}]}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let (_dir, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let id = Uuid::new_v4();
        insert(&mut conn, id, &doc("A")).await.unwrap();

        let loaded = load(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.json, doc("A"));
        assert!(load(&mut conn, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_bumps_revision() {
        let (_dir, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let original = insert(&mut conn, Uuid::new_v4(), &doc("A")).await.unwrap();
        let updated = replace(&mut conn, &original, doc("B")).await.unwrap().unwrap();
        assert_eq!(updated.revision, 2);

        let loaded = load(&mut conn, original.id).await.unwrap().unwrap();
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.json, doc("B"));
    }

    #[tokio::test]
    async fn test_stale_replace_is_rejected() {
        let (_dir, pool) = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let original = insert(&mut conn, Uuid::new_v4(), &doc("A")).await.unwrap();
        replace(&mut conn, &original, doc("B")).await.unwrap().unwrap();

        // Second writer still holds revision 1
        assert!(replace(&mut conn, &original, doc("C")).await.unwrap().is_none());
        let loaded = load(&mut conn, original.id).await.unwrap().unwrap();
        assert_eq!(loaded.json, doc("B"));
        assert_eq!(count(&mut conn).await.unwrap(), 1);
    }
}
