//! SQLite-backed search index
//!
//! Documents live in `search_index` next to the canonical store. Each bulk
//! item is applied on its own so one bad item never fails its neighbours.

use super::{BulkItemError, BulkItemResult, BulkOperation, BulkResponse, IndexedDocument, SearchIndex};
use crate::db::parse_uuid;
use async_trait::async_trait;
use bibrec_common::{Error, RecordJson, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open the index on `pool`, creating its table if needed
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS search_index (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                document TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn load(&self, id: Uuid) -> Result<Option<IndexedDocument>> {
        let row = sqlx::query("SELECT id, version, document FROM search_index WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn index_one(
        &self,
        id: Uuid,
        version: i64,
        mut document: RecordJson,
    ) -> Result<std::result::Result<(), BulkItemError>> {
        if let Some(stored) = self.load(id).await? {
            if version <= stored.version {
                return Ok(Err(BulkItemError::VersionConflict {
                    stored: stored.version,
                    attempted: version,
                }));
            }
            // Derived by the citation job, not part of the record itself
            if let Some(count) = stored.source.get("citation_count") {
                document.insert("citation_count".to_string(), count.clone());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO search_index (id, version, document)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                document = excluded.document
            WHERE excluded.version > search_index.version
            "#,
        )
        .bind(id.to_string())
        .bind(version)
        .bind(serde_json::to_string(&document)?)
        .execute(&self.pool)
        .await?;

        Ok(Ok(()))
    }

    async fn update_one(
        &self,
        id: Uuid,
        fields: serde_json::Map<String, Value>,
    ) -> Result<std::result::Result<(), BulkItemError>> {
        let Some(stored) = self.load(id).await? else {
            return Ok(Err(BulkItemError::NotFound));
        };

        let mut document = stored.source;
        document.extend(fields);

        sqlx::query("UPDATE search_index SET document = ? WHERE id = ?")
            .bind(serde_json::to_string(&document)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(Ok(()))
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<IndexedDocument> {
    let id: String = row.get("id");
    let document: String = row.get("document");
    Ok(IndexedDocument {
        id: parse_uuid(&id)?,
        version: row.get("version"),
        source: serde_json::from_str(&document)?,
    })
}

/// Item-level failure, or the backend error if the store itself is gone
fn item_outcome(
    result: Result<std::result::Result<(), BulkItemError>>,
) -> Result<std::result::Result<(), BulkItemError>> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.is_resource_failure() => Err(err),
        Err(err) => Ok(Err(BulkItemError::Failed(err.to_string()))),
    }
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse> {
        let mut items = Vec::with_capacity(operations.len());

        for operation in operations {
            let id = operation.id();
            let result = match operation {
                BulkOperation::Index {
                    id,
                    version,
                    document,
                } => self.index_one(id, version, document).await,
                BulkOperation::Update { id, fields } => self.update_one(id, fields).await,
            };
            items.push(BulkItemResult {
                id,
                outcome: item_outcome(result)?,
            });
        }

        Ok(BulkResponse { items })
    }

    async fn scan(&self, after: Option<Uuid>, size: usize) -> Result<Vec<IndexedDocument>> {
        let limit = i64::try_from(size)
            .map_err(|_| Error::InvalidInput(format!("scan size {} too large", size)))?;
        let after = after.map(|id| id.to_string()).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            SELECT id, version, document
            FROM search_index
            WHERE id > ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<IndexedDocument>> {
        self.load(id).await
    }
}
