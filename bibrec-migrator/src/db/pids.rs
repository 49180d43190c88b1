//! Persistent identifier store
//!
//! `(pid_type, pid_value)` is unique at the table level; a concurrent writer
//! losing the race to create the same identifier gets a UNIQUE violation and
//! replays its unit of work.

use super::parse_uuid;
use bibrec_common::pid::RECORD_OBJECT_TYPE;
use bibrec_common::{Error, PersistentIdentifier, PidStatus, Result};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;
use uuid::Uuid;

fn row_to_pid(row: &sqlx::sqlite::SqliteRow) -> Result<PersistentIdentifier> {
    let object_uuid: Option<String> = row.get("object_uuid");
    let status: String = row.get("status");

    Ok(PersistentIdentifier {
        id: row.get("id"),
        pid_type: row.get("pid_type"),
        pid_value: row.get("pid_value"),
        object_type: row.get("object_type"),
        object_uuid: object_uuid.as_deref().map(parse_uuid).transpose()?,
        status: status.parse()?,
    })
}

pub async fn get(
    conn: &mut SqliteConnection,
    pid_type: &str,
    pid_value: &str,
) -> Result<Option<PersistentIdentifier>> {
    let row = sqlx::query(
        r#"
        SELECT id, pid_type, pid_value, object_type, object_uuid, status
        FROM pidstore_pid
        WHERE pid_type = ? AND pid_value = ?
        "#,
    )
    .bind(pid_type)
    .bind(pid_value)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_pid).transpose()
}

/// Every PID pointing at `object_uuid`
pub async fn for_object(conn: &mut SqliteConnection, object_uuid: Uuid) -> Result<Vec<PersistentIdentifier>> {
    let rows = sqlx::query(
        r#"
        SELECT id, pid_type, pid_value, object_type, object_uuid, status
        FROM pidstore_pid
        WHERE object_uuid = ?
        ORDER BY id
        "#,
    )
    .bind(object_uuid.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(row_to_pid).collect()
}

/// Create a PID pointing at a canonical record
pub async fn create(
    conn: &mut SqliteConnection,
    pid_type: &str,
    pid_value: &str,
    object_uuid: Uuid,
    status: PidStatus,
) -> Result<PersistentIdentifier> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO pidstore_pid
            (pid_type, pid_value, object_type, object_uuid, status, created, updated)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(pid_type)
    .bind(pid_value)
    .bind(RECORD_OBJECT_TYPE)
    .bind(object_uuid.to_string())
    .bind(status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(PersistentIdentifier {
        id: result.last_insert_rowid(),
        pid_type: pid_type.to_string(),
        pid_value: pid_value.to_string(),
        object_type: Some(RECORD_OBJECT_TYPE.to_string()),
        object_uuid: Some(object_uuid),
        status,
    })
}

pub async fn set_status(conn: &mut SqliteConnection, id: i64, status: PidStatus) -> Result<()> {
    sqlx::query("UPDATE pidstore_pid SET status = ?, updated = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Point an existing PID (e.g. a reserved one) at a record and register it
pub async fn assign(conn: &mut SqliteConnection, id: i64, object_uuid: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pidstore_pid
        SET object_type = ?, object_uuid = ?, status = ?, updated = ?
        WHERE id = ?
        "#,
    )
    .bind(RECORD_OBJECT_TYPE)
    .bind(object_uuid.to_string())
    .bind(PidStatus::Registered.as_str())
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Next free numeric record id
pub async fn mint_recid(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query("INSERT INTO pidstore_recid DEFAULT VALUES")
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid() as u64)
}

/// Mark an explicitly declared id as taken so it is never minted
pub async fn reserve_recid(conn: &mut SqliteConnection, recid: u64) -> Result<()> {
    let value = i64::try_from(recid)
        .map_err(|_| Error::InvalidInput(format!("recid {} out of range", recid)))?;
    sqlx::query("INSERT OR IGNORE INTO pidstore_recid (recid) VALUES (?)")
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn redirect_target(conn: &mut SqliteConnection, from: Uuid) -> Result<Option<Uuid>> {
    let target: Option<String> =
        sqlx::query_scalar("SELECT to_uuid FROM pidstore_redirect WHERE from_uuid = ?")
            .bind(from.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    target.as_deref().map(parse_uuid).transpose()
}

/// Create or re-point the redirect edge leaving `from`
///
/// Callers check for cycles with [`redirect_chain`] first; the table itself
/// only rejects self-redirects.
pub async fn create_redirect(conn: &mut SqliteConnection, from: Uuid, to: Uuid) -> Result<()> {
    if from == to {
        return Err(Error::InvalidInput(format!("Self-redirect of {}", from)));
    }

    sqlx::query(
        r#"
        INSERT INTO pidstore_redirect (from_uuid, to_uuid, created)
        VALUES (?, ?, ?)
        ON CONFLICT(from_uuid) DO UPDATE SET to_uuid = excluded.to_uuid
        "#,
    )
    .bind(from.to_string())
    .bind(to.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Remove the redirect edge leaving `from`; returns whether one existed
pub async fn delete_redirect(conn: &mut SqliteConnection, from: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM pidstore_redirect WHERE from_uuid = ?")
        .bind(from.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// `start` followed by every uuid reached through redirect edges
///
/// The last element is the live end of the chain. Fails if the stored edges
/// already form a cycle.
pub async fn redirect_chain(conn: &mut SqliteConnection, start: Uuid) -> Result<Vec<Uuid>> {
    let mut chain = vec![start];
    let mut visited = HashSet::from([start]);
    let mut current = start;

    while let Some(next) = redirect_target(conn, current).await? {
        if !visited.insert(next) {
            return Err(Error::Internal(format!(
                "Redirect cycle through {} (from {})",
                next, start
            )));
        }
        chain.push(next);
        current = next;
    }

    Ok(chain)
}

/// Look up a PID and follow redirects to the live object
///
/// Returns the PID as stored plus the uuid at the end of its redirect chain.
pub async fn resolve(
    conn: &mut SqliteConnection,
    pid_type: &str,
    pid_value: &str,
) -> Result<Option<(PersistentIdentifier, Uuid)>> {
    let Some(pid) = get(conn, pid_type, pid_value).await? else {
        return Ok(None);
    };
    let Some(object_uuid) = pid.object_uuid else {
        return Ok(None);
    };

    let target = if pid.status == PidStatus::Redirected {
        let chain = redirect_chain(conn, object_uuid).await?;
        *chain.last().unwrap_or(&object_uuid)
    } else {
        object_uuid
    };

    Ok(Some((pid, target)))
}
