//! Upsert engine
//!
//! The only writer of canonical records and PIDs. Each call is one unit of
//! work in its own transaction: identifier reconciliation, the record write
//! and any tombstone/redirect bookkeeping commit together or not at all.
//!
//! Tombstones:
//! - `deleted: true` with a resolvable `new_record` merges the record into its
//!   successor: redirect edge, PID status `redirected`, back-reference in the
//!   successor's `deleted_records`.
//! - `deleted: true` otherwise is a soft delete: PID status `deleted`.
//! - A record coming back without `deleted` is restored: PID `registered`,
//!   outgoing redirect removed along with its back-reference on the former
//!   successor.

use crate::db::{pids, records};
use crate::utils::{begin_monitored, retry_on_conflict, RetryPolicy, Retryable};
use crate::validation::{self, ValidationError};
use bibrec_common::{
    record, CanonicalRecord, Error, PidStatus, RecordJson, RecordKind, RecordRef,
};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error as ThisError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Secondary PID type for arXiv identifiers
pub const ARXIV_PID_TYPE: &str = "arxiv";

#[derive(Debug, ThisError)]
pub enum UpsertError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Optimistic-concurrency loss; `attempts` is set once the retry budget is spent
    #[error("concurrent modification: {reason} (after {attempts} attempts)")]
    Conflict { reason: String, attempts: u32 },

    #[error("redirect refused for {pid}: {reason}")]
    Redirect { pid: String, reason: String },

    #[error("persistence failed: {0}")]
    Persistence(Error),

    #[error("store unavailable: {0}")]
    Unavailable(Error),
}

impl UpsertError {
    fn conflict(reason: impl Into<String>) -> Self {
        UpsertError::Conflict {
            reason: reason.into(),
            attempts: 1,
        }
    }

    /// The store itself failed; the run cannot continue
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, UpsertError::Unavailable(_))
    }
}

impl From<Error> for UpsertError {
    fn from(err: Error) -> Self {
        if err.is_resource_failure() {
            UpsertError::Unavailable(err)
        } else {
            UpsertError::Persistence(err)
        }
    }
}

impl From<sqlx::Error> for UpsertError {
    fn from(err: sqlx::Error) -> Self {
        Error::from(err).into()
    }
}

impl Retryable for UpsertError {
    fn is_retryable(&self) -> bool {
        match self {
            UpsertError::Conflict { .. } => true,
            UpsertError::Persistence(err) => err.is_lock_contention() || err.is_unique_violation(),
            _ => false,
        }
    }

    fn exhausted(self, attempts: u32) -> Self {
        match self {
            UpsertError::Conflict { reason, .. } => UpsertError::Conflict { reason, attempts },
            UpsertError::Persistence(err) => UpsertError::Conflict {
                reason: err.to_string(),
                attempts,
            },
            other => other,
        }
    }
}

/// What the upsert did to the record's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Live,
    SoftDeleted,
    Merged { into: Uuid },
}

#[derive(Debug, Clone)]
pub struct UpsertedRecord {
    pub record: CanonicalRecord,
    pub kind: RecordKind,
    pub recid: u64,
    /// A new object was created (as opposed to a new revision)
    pub created: bool,
    pub disposition: Disposition,
    /// Successor touched by a merge or a restore; needs re-indexing too
    pub successor: Option<CanonicalRecord>,
}

impl UpsertedRecord {
    /// Every record this upsert wrote
    pub fn written(&self) -> impl Iterator<Item = &CanonicalRecord> {
        std::iter::once(&self.record).chain(self.successor.as_ref())
    }
}

#[derive(Clone)]
pub struct UpsertEngine {
    pool: SqlitePool,
    retry: RetryPolicy,
    base_url: String,
}

impl UpsertEngine {
    pub fn new(pool: SqlitePool, retry: RetryPolicy, base_url: impl Into<String>) -> Self {
        Self {
            pool,
            retry,
            base_url: base_url.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Validate and apply one canonical record
    pub async fn upsert(&self, json: RecordJson) -> Result<UpsertedRecord, UpsertError> {
        let kind = validation::validate(&json)?;
        let declared = record::control_number(&json);
        let json = &json;

        retry_on_conflict("upsert", &self.retry, || self.apply(json, kind, declared)).await
    }

    async fn apply(
        &self,
        json: &RecordJson,
        kind: RecordKind,
        declared: Option<u64>,
    ) -> Result<UpsertedRecord, UpsertError> {
        let mut tx = begin_monitored(&self.pool, "upsert::apply").await?;
        let pid_type = kind.pid_type();
        let mut json = json.clone();

        let recid = match declared {
            Some(recid) => {
                pids::reserve_recid(tx.conn(), recid).await?;
                recid
            }
            None => {
                let recid = pids::mint_recid(tx.conn()).await?;
                json.insert("control_number".to_string(), Value::from(recid));
                recid
            }
        };
        let pid_value = recid.to_string();

        let existing_pid = pids::get(tx.conn(), pid_type, &pid_value).await?;
        let current = match existing_pid.as_ref().and_then(|p| p.object_uuid) {
            Some(uuid) => records::load(tx.conn(), uuid).await?,
            None => None,
        };

        let (saved, created) = match current {
            Some(current) => {
                preserve_back_references(&current.json, &mut json);
                let saved = records::replace(tx.conn(), &current, json)
                    .await?
                    .ok_or_else(|| {
                        UpsertError::conflict(format!("{}:{} changed underneath", pid_type, pid_value))
                    })?;
                (saved, false)
            }
            None => {
                let id = existing_pid
                    .as_ref()
                    .and_then(|p| p.object_uuid)
                    .unwrap_or_else(Uuid::new_v4);
                let saved = records::insert(tx.conn(), id, &json).await?;
                match &existing_pid {
                    Some(pid) => pids::assign(tx.conn(), pid.id, id).await?,
                    None => {
                        pids::create(tx.conn(), pid_type, &pid_value, id, PidStatus::Registered)
                            .await?;
                    }
                }
                (saved, true)
            }
        };

        let pid = pids::get(tx.conn(), pid_type, &pid_value)
            .await?
            .ok_or_else(|| Error::Internal(format!("PID {}:{} vanished", pid_type, pid_value)))?;

        let (disposition, successor) = if saved.is_deleted() {
            self.apply_tombstone(tx.conn(), &saved, kind, pid.id, &pid.to_string())
                .await?
        } else {
            if pid.status != PidStatus::Registered {
                pids::set_status(tx.conn(), pid.id, PidStatus::Registered).await?;
            }
            let former = self
                .detach_from_successor(tx.conn(), &saved, kind, &pid.to_string())
                .await?;
            (Disposition::Live, former)
        };

        register_arxiv_pids(tx.conn(), &saved).await?;

        tx.commit().await?;

        debug!(recid, pid_type, revision = saved.revision, created, "Record upserted");

        Ok(UpsertedRecord {
            record: saved,
            kind,
            recid,
            created,
            disposition,
            successor,
        })
    }

    async fn apply_tombstone(
        &self,
        conn: &mut SqliteConnection,
        saved: &CanonicalRecord,
        kind: RecordKind,
        pid_id: i64,
        pid_label: &str,
    ) -> Result<(Disposition, Option<CanonicalRecord>), UpsertError> {
        let successor_uuid = match saved.new_record() {
            Some(reference) => self.resolve_successor(conn, saved.id, &reference, pid_label).await?,
            None => None,
        };

        let successor = match successor_uuid {
            Some(uuid) => records::load(conn, uuid).await?,
            None => None,
        };

        let Some(successor) = successor else {
            if saved.new_record().is_some() {
                warn!(pid = pid_label, "Successor not found, applying soft delete");
            }
            pids::set_status(conn, pid_id, PidStatus::Deleted).await?;
            let former = self.detach_from_successor(conn, saved, kind, pid_label).await?;
            return Ok((Disposition::SoftDeleted, former));
        };

        pids::create_redirect(conn, saved.id, successor.id).await?;
        pids::set_status(conn, pid_id, PidStatus::Redirected).await?;

        let back_ref = self.back_reference(kind, saved);
        let mut successor_json = successor.json.clone();
        let successor = if add_back_reference(&mut successor_json, back_ref) {
            records::replace(conn, &successor, successor_json)
                .await?
                .ok_or_else(|| UpsertError::conflict(format!("successor of {} changed underneath", pid_label)))?
        } else {
            successor
        };

        Ok((Disposition::Merged { into: successor.id }, Some(successor)))
    }

    /// Remove the redirect leaving `saved` and its entry in the former
    /// successor's `deleted_records`
    ///
    /// Returns the former successor when its back-references changed.
    async fn detach_from_successor(
        &self,
        conn: &mut SqliteConnection,
        saved: &CanonicalRecord,
        kind: RecordKind,
        pid_label: &str,
    ) -> Result<Option<CanonicalRecord>, UpsertError> {
        let Some(target) = pids::redirect_target(conn, saved.id).await? else {
            return Ok(None);
        };
        pids::delete_redirect(conn, saved.id).await?;
        debug!(pid = pid_label, former = %target, "Removed redirect of previously merged record");

        let Some(former) = records::load(conn, target).await? else {
            return Ok(None);
        };
        let mut former_json = former.json.clone();
        if !remove_back_reference(&mut former_json, &self.back_reference(kind, saved)) {
            return Ok(None);
        }
        let former = records::replace(conn, &former, former_json)
            .await?
            .ok_or_else(|| UpsertError::conflict(format!("former successor of {} changed underneath", pid_label)))?;
        Ok(Some(former))
    }

    fn back_reference(&self, kind: RecordKind, saved: &CanonicalRecord) -> Value {
        RecordRef::new(kind, saved.control_number().unwrap_or_default().to_string()).to_json(&self.base_url)
    }

    /// Uuid of the live record `reference` points at, refusing cycles
    async fn resolve_successor(
        &self,
        conn: &mut SqliteConnection,
        own: Uuid,
        reference: &RecordRef,
        pid_label: &str,
    ) -> Result<Option<Uuid>, UpsertError> {
        let Some(pid_type) = reference.pid_type() else {
            return Ok(None);
        };
        let Some(pid) = pids::get(conn, pid_type, &reference.value).await? else {
            return Ok(None);
        };
        let Some(start) = pid.object_uuid else {
            return Ok(None);
        };

        let refused = |reason: &str| UpsertError::Redirect {
            pid: pid_label.to_string(),
            reason: reason.to_string(),
        };

        if start == own {
            return Err(refused("record supersedes itself"));
        }

        let chain = pids::redirect_chain(conn, start)
            .await
            .map_err(|e| refused(&e.to_string()))?;
        if chain.contains(&own) {
            return Err(refused("successor chain leads back to this record"));
        }

        Ok(chain.last().copied())
    }
}

/// Keep system-maintained `deleted_records` when legacy input replaces a record
fn preserve_back_references(current: &RecordJson, incoming: &mut RecordJson) {
    let Some(Value::Array(existing)) = current.get("deleted_records") else {
        return;
    };
    for back_ref in existing {
        add_back_reference(incoming, back_ref.clone());
    }
}

/// Add `back_ref` to `deleted_records` unless present; returns whether it changed
fn add_back_reference(json: &mut RecordJson, back_ref: Value) -> bool {
    let entry = json
        .entry("deleted_records")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    match entry {
        Value::Array(items) if !items.contains(&back_ref) => {
            items.push(back_ref);
            true
        }
        _ => false,
    }
}

/// Drop `back_ref` from `deleted_records`; returns whether it was present
fn remove_back_reference(json: &mut RecordJson, back_ref: &Value) -> bool {
    let Some(Value::Array(items)) = json.get_mut("deleted_records") else {
        return false;
    };
    let before = items.len();
    items.retain(|item| item != back_ref);
    let removed = items.len() != before;
    if items.is_empty() {
        json.remove("deleted_records");
    }
    removed
}

/// Register `arxiv` PIDs without re-pointing ones owned by another record
async fn register_arxiv_pids(conn: &mut SqliteConnection, saved: &CanonicalRecord) -> Result<(), UpsertError> {
    let eprints: Vec<String> = saved
        .json
        .get("arxiv_eprints")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|e| e.get("value").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    for eprint in eprints {
        match pids::get(conn, ARXIV_PID_TYPE, &eprint).await? {
            None => {
                pids::create(conn, ARXIV_PID_TYPE, &eprint, saved.id, PidStatus::Registered).await?;
            }
            Some(pid) if pid.object_uuid == Some(saved.id) => {}
            Some(pid) => {
                warn!(
                    arxiv = %eprint,
                    owner = ?pid.object_uuid,
                    record = %saved.id,
                    "arXiv identifier already owned by another record, skipping"
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use serde_json::json;

    const BASE: &str = "http://localhost:5000";

    fn lit(value: Value) -> RecordJson {
        let mut json = match json!({
            "$schema": "http://localhost:5000/schemas/records/hep.json",
            "_collections": ["Literature"],
            "titles": [{"title": "T"}]
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        if let Value::Object(extra) = value {
            json.extend(extra);
        }
        json
    }

    fn engine(pool: &SqlitePool) -> UpsertEngine {
        UpsertEngine::new(pool.clone(), RetryPolicy::default(), BASE)
    }

    #[tokio::test]
    async fn test_mints_id_when_absent() {
        let (_dir, pool) = test_pool().await;
        let engine = engine(&pool);

        let first = engine.upsert(lit(json!({}))).await.unwrap();
        let second = engine.upsert(lit(json!({}))).await.unwrap();
        assert!(first.created && second.created);
        assert_ne!(first.recid, second.recid);
        assert_eq!(first.record.control_number(), Some(first.recid));
    }

    #[tokio::test]
    async fn test_same_id_twice_is_new_revision() {
        let (_dir, pool) = test_pool().await;
        let engine = engine(&pool);

        let first = engine.upsert(lit(json!({"control_number": 7}))).await.unwrap();
        let second = engine.upsert(lit(json!({"control_number": 7}))).await.unwrap();
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(second.record.revision, 2);
        assert!(!second.created);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(records::count(&mut conn).await.unwrap(), 1);
        assert_eq!(pids::for_object(&mut conn, first.record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let (_dir, pool) = test_pool().await;
        let mut json = lit(json!({"control_number": 3}));
        json.remove("titles");

        let err = engine(&pool).upsert(json).await.unwrap_err();
        assert!(matches!(err, UpsertError::Validation(_)));

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(records::count(&mut conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_soft_delete_without_successor() {
        let (_dir, pool) = test_pool().await;
        let engine = engine(&pool);

        let deleted = engine
            .upsert(lit(json!({"control_number": 4, "deleted": true})))
            .await
            .unwrap();
        assert_eq!(deleted.disposition, Disposition::SoftDeleted);

        let unresolved = engine
            .upsert(lit(json!({
                "control_number": 5,
                "deleted": true,
                "new_record": {"$ref": "http://localhost:5000/api/literature/999"}
            })))
            .await
            .unwrap();
        assert_eq!(unresolved.disposition, Disposition::SoftDeleted);

        let mut conn = pool.acquire().await.unwrap();
        let pid = pids::get(&mut conn, "lit", "5").await.unwrap().unwrap();
        assert_eq!(pid.status, PidStatus::Deleted);
    }

    #[tokio::test]
    async fn test_self_redirect_refused() {
        let (_dir, pool) = test_pool().await;
        let engine = engine(&pool);

        engine.upsert(lit(json!({"control_number": 8}))).await.unwrap();
        let err = engine
            .upsert(lit(json!({
                "control_number": 8,
                "deleted": true,
                "new_record": {"$ref": "http://localhost:5000/api/literature/8"}
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::Redirect { .. }));
    }

    #[tokio::test]
    async fn test_arxiv_pid_not_stolen() {
        let (_dir, pool) = test_pool().await;
        let engine = engine(&pool);

        let owner = engine
            .upsert(lit(json!({"control_number": 1, "arxiv_eprints": [{"value": "1601.00001"}]})))
            .await
            .unwrap();
        engine
            .upsert(lit(json!({"control_number": 2, "arxiv_eprints": [{"value": "1601.00001"}]})))
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let pid = pids::get(&mut conn, ARXIV_PID_TYPE, "1601.00001").await.unwrap().unwrap();
        assert_eq!(pid.object_uuid, Some(owner.record.id));
    }

    #[test]
    fn test_back_reference_dedup() {
        let mut json = RecordJson::new();
        let r = json!({"$ref": "http://h/api/literature/1"});
        assert!(add_back_reference(&mut json, r.clone()));
        assert!(!add_back_reference(&mut json, r.clone()));
        assert_eq!(json["deleted_records"].as_array().unwrap().len(), 1);

        assert!(remove_back_reference(&mut json, &r));
        assert!(!remove_back_reference(&mut json, &r));
        assert!(!json.contains_key("deleted_records"));
    }

    #[tokio::test]
    async fn test_restore_detaches_from_former_successor() {
        let (_dir, pool) = test_pool().await;
        let engine = engine(&pool);

        engine.upsert(lit(json!({"control_number": 20}))).await.unwrap();
        let merged = engine
            .upsert(lit(json!({
                "control_number": 21,
                "deleted": true,
                "new_record": {"$ref": "http://localhost:5000/api/literature/20"}
            })))
            .await
            .unwrap();
        assert!(matches!(merged.disposition, Disposition::Merged { .. }));
        assert!(merged.successor.unwrap().json.contains_key("deleted_records"));

        let restored = engine.upsert(lit(json!({"control_number": 21}))).await.unwrap();
        assert_eq!(restored.disposition, Disposition::Live);
        let former = restored.successor.unwrap();
        assert_eq!(former.control_number(), Some(20));
        assert_eq!(former.revision, 3);
        assert!(!former.json.contains_key("deleted_records"));

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(pids::redirect_target(&mut conn, restored.record.id).await.unwrap(), None);
    }

    #[test]
    fn test_error_classification() {
        assert!(UpsertError::conflict("x").is_retryable());
        assert!(!UpsertError::Validation(ValidationError::UnknownSchema).is_retryable());
        let unavailable = UpsertError::from(Error::Database(sqlx::Error::PoolClosed));
        assert!(unavailable.is_resource_failure());
        assert!(!unavailable.is_retryable());

        match UpsertError::conflict("x").exhausted(5) {
            UpsertError::Conflict { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected {:?}", other),
        }
    }
}
