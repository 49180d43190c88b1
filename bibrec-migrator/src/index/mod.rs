//! Search index contract
//!
//! The pipeline talks to the index backend only through [`SearchIndex`]:
//! bulk writes, keyset-paginated scans and point lookups. [`SqliteIndex`] is
//! the bundled backend; [`IndexerBridge`] builds the bulk operations.

mod bridge;
mod sqlite;

pub use bridge::{IndexReport, IndexerBridge};
pub use sqlite::SqliteIndex;

use async_trait::async_trait;
use bibrec_common::{RecordJson, Result};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Bulk operations
// ============================================================================

/// One item of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Write a full document, externally versioned: accepted only when
    /// `version` is greater than the stored one
    Index {
        id: Uuid,
        version: i64,
        document: RecordJson,
    },
    /// Merge `fields` into an existing document
    Update {
        id: Uuid,
        fields: serde_json::Map<String, Value>,
    },
}

impl BulkOperation {
    pub fn id(&self) -> Uuid {
        match self {
            BulkOperation::Index { id, .. } | BulkOperation::Update { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkItemError {
    #[error("version conflict: stored {stored}, attempted {attempted}")]
    VersionConflict { stored: i64, attempted: i64 },

    #[error("document not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub id: Uuid,
    pub outcome: std::result::Result<(), BulkItemError>,
}

/// Per-item results, in request order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|i| i.outcome.is_err())
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: Uuid,
    pub version: i64,
    pub source: RecordJson,
}

impl IndexedDocument {
    pub fn citation_count(&self) -> Option<u64> {
        self.source.get("citation_count").and_then(Value::as_u64)
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// Index backend
///
/// A returned `Err` means the backend itself failed; individual item
/// failures are reported inside [`BulkResponse`].
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse>;

    /// Up to `size` documents with ids strictly after `after`, in id order
    async fn scan(&self, after: Option<Uuid>, size: usize) -> Result<Vec<IndexedDocument>>;

    async fn get(&self, id: Uuid) -> Result<Option<IndexedDocument>>;
}
