//! Merge, soft delete and restore through the full pipeline

mod helpers;

use bibrec_common::PidStatus;
use bibrec_migrator::db::pids;
use helpers::*;

fn merged(recid: u64, into: u64, references: &[u64]) -> String {
    let refs: String = references.iter().map(|r| cites(*r)).collect();
    marc(
        recid,
        &["HEP"],
        &format!("{}{}{}", deleted(), superseded_by(into), refs),
    )
}

fn back_references(record: &bibrec_common::CanonicalRecord) -> Vec<String> {
    record
        .json
        .get("deleted_records")
        .and_then(|v| v.as_array())
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r.get("$ref").and_then(|v| v.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_merge_redirects_to_successor() {
    let env = TestEnv::new().await;
    env.migrate("initial.xml", &collection(&[paper(1, &[]), paper(2, &[])]))
        .await;
    let a = env.literature(1).await.unwrap();
    let b = env.literature(2).await.unwrap();

    let summary = env.migrate("merge.xml", &collection(&[merged(1, 2, &[])])).await;
    assert_eq!(summary.migrated, 1);

    // PID of A now resolves to B
    let mut conn = env.pool.acquire().await.unwrap();
    let (pid, target) = pids::resolve(&mut conn, "lit", "1").await.unwrap().unwrap();
    assert_eq!(pid.status, PidStatus::Redirected);
    assert_eq!(target, b.id);

    let chain = pids::redirect_chain(&mut conn, a.id).await.unwrap();
    assert_eq!(chain, vec![a.id, b.id]);
    drop(conn);

    let a = env.literature(1).await.unwrap();
    assert!(a.is_deleted());

    let b = env.literature(2).await.unwrap();
    assert_eq!(b.revision, 2);
    assert_eq!(
        back_references(&b),
        vec![format!("{}/api/literature/1", BASE_URL)]
    );

    // Both sides are re-indexed
    assert_eq!(env.document(2).await.unwrap().version, 2);
    assert!(bibrec_common::record::is_deleted(
        &env.document(1).await.unwrap().source
    ));
}

#[tokio::test]
async fn test_successor_remigration_keeps_back_references() {
    let env = TestEnv::new().await;
    env.migrate(
        "initial.xml",
        &collection(&[paper(2, &[]), merged(1, 2, &[])]),
    )
    .await;

    // Legacy input for B knows nothing about deleted_records
    env.migrate("again.xml", &collection(&[paper(2, &[])])).await;

    let b = env.literature(2).await.unwrap();
    assert_eq!(b.revision, 3);
    assert_eq!(back_references(&b).len(), 1);

    // Replaying the merge does not duplicate the back-reference
    env.migrate("merge.xml", &collection(&[merged(1, 2, &[])])).await;
    assert_eq!(back_references(&env.literature(2).await.unwrap()).len(), 1);
}

#[tokio::test]
async fn test_soft_delete_and_restore() {
    let env = TestEnv::new().await;
    env.migrate("initial.xml", &collection(&[paper(5, &[])])).await;

    let tombstone = marc(5, &["HEP"], &deleted());
    env.migrate("delete.xml", &collection(&[tombstone])).await;

    let pid = env.pid("lit", "5").await.unwrap();
    assert_eq!(pid.status, PidStatus::Deleted);
    assert!(env.literature(5).await.unwrap().is_deleted());

    env.migrate("restore.xml", &collection(&[paper(5, &[])])).await;

    let pid = env.pid("lit", "5").await.unwrap();
    assert_eq!(pid.status, PidStatus::Registered);
    let record = env.literature(5).await.unwrap();
    assert!(!record.is_deleted());
    assert_eq!(record.revision, 3);
}

#[tokio::test]
async fn test_restore_removes_redirect() {
    let env = TestEnv::new().await;
    env.migrate(
        "initial.xml",
        &collection(&[paper(2, &[]), merged(1, 2, &[])]),
    )
    .await;
    let a = env.literature(1).await.unwrap();

    env.migrate("restore.xml", &collection(&[paper(1, &[])])).await;

    let mut conn = env.pool.acquire().await.unwrap();
    assert_eq!(pids::redirect_target(&mut conn, a.id).await.unwrap(), None);
    let (pid, target) = pids::resolve(&mut conn, "lit", "1").await.unwrap().unwrap();
    assert_eq!(pid.status, PidStatus::Registered);
    assert_eq!(target, a.id);
    drop(conn);

    // The former successor no longer lists the restored record
    let b = env.literature(2).await.unwrap();
    assert!(back_references(&b).is_empty());
    assert_eq!(b.revision, 3);
    assert_eq!(env.document(2).await.unwrap().version, 3);
}

#[tokio::test]
async fn test_merge_with_unknown_successor_is_soft_delete() {
    let env = TestEnv::new().await;
    let summary = env
        .migrate("export.xml", &collection(&[merged(3, 999, &[])]))
        .await;
    assert_eq!(summary.migrated, 1);
    assert_eq!(env.pid("lit", "3").await.unwrap().status, PidStatus::Deleted);
}

#[tokio::test]
async fn test_redirect_cycle_refused() {
    let env = TestEnv::new().await;
    env.migrate(
        "initial.xml",
        &collection(&[paper(2, &[]), merged(1, 2, &[])]),
    )
    .await;

    // B merged back into A would close a loop
    let summary = env.migrate("cycle.xml", &collection(&[merged(2, 1, &[])])).await;
    assert_eq!(summary.failed, 1);

    let row = env.mirror_row(2).await.unwrap();
    assert_eq!(row.valid, Some(false));
    assert!(row.error.unwrap().contains("redirect refused"));

    // Nothing from the refused upsert was committed
    let b = env.literature(2).await.unwrap();
    assert!(!b.is_deleted());
    assert_eq!(b.revision, 2);
    assert_eq!(env.pid("lit", "2").await.unwrap().status, PidStatus::Registered);
}

#[tokio::test]
async fn test_self_merge_refused() {
    let env = TestEnv::new().await;
    env.migrate("initial.xml", &collection(&[paper(4, &[])])).await;

    let summary = env.migrate("self.xml", &collection(&[merged(4, 4, &[])])).await;
    assert_eq!(summary.failed, 1);
    assert!(!env.literature(4).await.unwrap().is_deleted());
}
