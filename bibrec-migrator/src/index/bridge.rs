//! Indexer bridge
//!
//! Turns upserted records and citation counts into bulk operations.

use super::{BulkItemError, BulkOperation, BulkResponse, SearchIndex};
use bibrec_common::{CanonicalRecord, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Aggregate outcome of one or more bulk requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    /// Index writes rejected because a newer revision is already indexed
    pub stale: usize,
    pub failed: usize,
}

impl IndexReport {
    fn absorb(&mut self, response: &BulkResponse) {
        for item in &response.items {
            match &item.outcome {
                Ok(()) => self.indexed += 1,
                Err(BulkItemError::VersionConflict { stored, attempted }) => {
                    debug!(id = %item.id, stored, attempted, "Skipped stale index write");
                    self.stale += 1;
                }
                Err(err) => {
                    warn!(id = %item.id, error = %err, "Bulk item failed");
                    self.failed += 1;
                }
            }
        }
    }

    pub fn merge(&mut self, other: IndexReport) {
        self.indexed += other.indexed;
        self.stale += other.stale;
        self.failed += other.failed;
    }
}

#[derive(Clone)]
pub struct IndexerBridge {
    index: Arc<dyn SearchIndex>,
}

impl IndexerBridge {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    /// One index operation per record, keyed by uuid and versioned by revision
    ///
    /// A record touched twice in the batch is sent once, at its highest revision.
    pub async fn index_records<'a, I>(&self, records: I) -> Result<IndexReport>
    where
        I: IntoIterator<Item = &'a CanonicalRecord>,
    {
        let mut latest: HashMap<Uuid, &CanonicalRecord> = HashMap::new();
        for record in records {
            latest
                .entry(record.id)
                .and_modify(|held| {
                    if record.revision > held.revision {
                        *held = record;
                    }
                })
                .or_insert(record);
        }

        if latest.is_empty() {
            return Ok(IndexReport::default());
        }

        let mut operations: Vec<BulkOperation> = latest
            .into_values()
            .map(|record| BulkOperation::Index {
                id: record.id,
                version: record.revision,
                document: record.json.clone(),
            })
            .collect();
        operations.sort_by_key(BulkOperation::id);

        let response = self.index.bulk(operations).await?;
        let mut report = IndexReport::default();
        report.absorb(&response);
        Ok(report)
    }

    /// `citation_count` updates, sent in bulk requests of `batch_size`
    pub async fn update_citation_counts(
        &self,
        counts: &[(Uuid, u64)],
        batch_size: usize,
    ) -> Result<IndexReport> {
        let mut report = IndexReport::default();

        for batch in counts.chunks(batch_size.max(1)) {
            let operations = batch
                .iter()
                .map(|(id, count)| {
                    let mut fields = serde_json::Map::new();
                    fields.insert("citation_count".to_string(), Value::from(*count));
                    BulkOperation::Update { id: *id, fields }
                })
                .collect();

            let response = self.index.bulk(operations).await?;
            report.absorb(&response);
            debug!(batch = batch.len(), ok = response.succeeded(), "Citation batch written");
        }

        Ok(report)
    }
}
