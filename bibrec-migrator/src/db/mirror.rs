//! Legacy mirror table operations
//!
//! One row per legacy numeric id holding the compressed original bytes and
//! the outcome of the latest migration attempt. `valid` is NULL while a row
//! is staged but not yet attempted.

use bibrec_common::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sqlx::{Row, SqlitePool};
use std::io::{Read, Write};

/// Which mirror rows a re-migration should pick up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorSelection {
    /// Rows whose last attempt failed or that were never attempted
    #[default]
    Unmigrated,
    All,
}

/// Mirror row without its payload
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub recid: u64,
    pub collection: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub valid: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorCounts {
    pub valid: i64,
    pub invalid: i64,
    pub pending: i64,
}

impl MirrorCounts {
    pub fn total(&self) -> i64 {
        self.valid + self.invalid + self.pending
    }
}

pub fn compress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 3), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

pub fn decompress(blob: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(blob.len() * 3);
    ZlibDecoder::new(blob).read_to_end(&mut raw)?;
    Ok(raw)
}

fn to_sql_id(recid: u64) -> Result<i64> {
    i64::try_from(recid).map_err(|_| Error::InvalidInput(format!("recid {} out of range", recid)))
}

/// Write the raw bytes of a record about to be attempted
///
/// Overwrites any previous row for `recid` (last write wins) and resets the
/// outcome to pending.
pub async fn stage(
    pool: &SqlitePool,
    recid: u64,
    raw: &[u8],
    collection: Option<&str>,
) -> Result<()> {
    let blob = compress(raw)?;

    sqlx::query(
        r#"
        INSERT INTO legacy_records_mirror (recid, marcxml, collection, last_updated, valid, error)
        VALUES (?, ?, ?, ?, NULL, NULL)
        ON CONFLICT(recid) DO UPDATE SET
            marcxml = excluded.marcxml,
            collection = excluded.collection,
            last_updated = excluded.last_updated,
            valid = NULL,
            error = NULL
        "#,
    )
    .bind(to_sql_id(recid)?)
    .bind(blob)
    .bind(collection)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the outcome of a migration attempt
pub async fn mark(pool: &SqlitePool, recid: u64, valid: bool, error: Option<&str>) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE legacy_records_mirror
        SET valid = ?, error = ?, last_updated = ?
        WHERE recid = ?
        "#,
    )
    .bind(valid)
    .bind(error)
    .bind(Utc::now())
    .bind(to_sql_id(recid)?)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("mirror row {}", recid)));
    }

    Ok(())
}

/// Decompressed original bytes of a mirror row
pub async fn load_raw(pool: &SqlitePool, recid: u64) -> Result<Option<Vec<u8>>> {
    let blob: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT marcxml FROM legacy_records_mirror WHERE recid = ?")
            .bind(to_sql_id(recid)?)
            .fetch_optional(pool)
            .await?;

    blob.as_deref().map(decompress).transpose()
}

pub async fn get(pool: &SqlitePool, recid: u64) -> Result<Option<MirrorRow>> {
    let row = sqlx::query(
        r#"
        SELECT recid, collection, last_updated, valid, error
        FROM legacy_records_mirror
        WHERE recid = ?
        "#,
    )
    .bind(to_sql_id(recid)?)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| row_to_mirror(&row)))
}

fn row_to_mirror(row: &sqlx::sqlite::SqliteRow) -> MirrorRow {
    let recid: i64 = row.get("recid");
    MirrorRow {
        recid: recid as u64,
        collection: row.get("collection"),
        last_updated: row.get("last_updated"),
        valid: row.get("valid"),
        error: row.get("error"),
    }
}

/// Ids to re-drive, in ascending order
pub async fn select_recids(pool: &SqlitePool, selection: MirrorSelection) -> Result<Vec<u64>> {
    let sql = match selection {
        MirrorSelection::Unmigrated => {
            "SELECT recid FROM legacy_records_mirror WHERE valid IS NULL OR valid = 0 ORDER BY recid"
        }
        MirrorSelection::All => "SELECT recid FROM legacy_records_mirror ORDER BY recid",
    };

    let ids: Vec<i64> = sqlx::query_scalar(sql).fetch_all(pool).await?;
    Ok(ids.into_iter().map(|id| id as u64).collect())
}

pub async fn counts(pool: &SqlitePool) -> Result<MirrorCounts> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN valid = 1 THEN 1 ELSE 0 END), 0) AS valid,
            COALESCE(SUM(CASE WHEN valid = 0 THEN 1 ELSE 0 END), 0) AS invalid,
            COALESCE(SUM(CASE WHEN valid IS NULL THEN 1 ELSE 0 END), 0) AS pending
        FROM legacy_records_mirror
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(MirrorCounts {
        valid: row.get("valid"),
        invalid: row.get("invalid"),
        pending: row.get("pending"),
    })
}

/// Rows whose latest attempt failed
pub async fn broken(pool: &SqlitePool) -> Result<Vec<MirrorRow>> {
    let rows = sqlx::query(
        r#"
        SELECT recid, collection, last_updated, valid, error
        FROM legacy_records_mirror
        WHERE valid = 0
        ORDER BY recid
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_mirror).collect())
}

/// Most frequent failure messages with their row counts
pub async fn top_errors(pool: &SqlitePool, limit: i64) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        r#"
        SELECT error, COUNT(*) AS n
        FROM legacy_records_mirror
        WHERE valid = 0 AND error IS NOT NULL
        GROUP BY error
        ORDER BY n DESC, error
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("error"), row.get("n")))
        .collect())
}
