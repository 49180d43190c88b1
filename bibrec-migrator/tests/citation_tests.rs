//! Citation aggregation over migrated corpora

mod helpers;

use bibrec_common::config::{SupersededCiting, TomlConfig};
use helpers::*;

fn merged_citing(recid: u64, into: u64, references: &[u64]) -> String {
    let refs: String = references.iter().map(|r| cites(*r)).collect();
    marc(
        recid,
        &["HEP"],
        &format!("{}{}{}", deleted(), superseded_by(into), refs),
    )
}

#[tokio::test]
async fn test_counts_distinct_citing_records() {
    let env = TestEnv::new().await;
    env.migrate(
        "export.xml",
        &collection(&[paper(1, &[]), paper(2, &[1]), paper(3, &[1, 1])]),
    )
    .await;

    let report = env.count_citations().await;
    assert_eq!(report.scanned, 3);
    assert_eq!(report.citing, 3);

    // Record 3 cites 1 twice but counts once
    assert_eq!(env.citation_count(1).await, Some(2));
    assert_eq!(env.citation_count(2).await, Some(0));
    assert_eq!(env.citation_count(3).await, Some(0));
}

#[tokio::test]
async fn test_soft_deleted_citer_stops_counting() {
    let env = TestEnv::new().await;
    env.migrate(
        "export.xml",
        &collection(&[paper(10, &[]), paper(11, &[10]), paper(12, &[10])]),
    )
    .await;
    env.count_citations().await;
    assert_eq!(env.citation_count(10).await, Some(2));

    let tombstone = marc(11, &["HEP"], &format!("{}{}", deleted(), cites(10)));
    env.migrate("delete.xml", &collection(&[tombstone])).await;

    // Each run overwrites the previous counts
    env.count_citations().await;
    assert_eq!(env.citation_count(10).await, Some(1));
}

#[tokio::test]
async fn test_superseded_citer_excluded_by_default() {
    let env = TestEnv::new().await;
    env.migrate(
        "export.xml",
        &collection(&[paper(20, &[]), paper(21, &[]), merged_citing(22, 21, &[20])]),
    )
    .await;

    let report = env.count_citations().await;
    assert_eq!(report.attributed, 0);
    assert_eq!(env.citation_count(20).await, Some(0));
}

#[tokio::test]
async fn test_superseded_citer_attributed_to_successor() {
    let mut config = TomlConfig::default();
    config.citations.superseded_citing = SupersededCiting::AttributeToSuccessor;
    let env = TestEnv::with_config(config).await;

    env.migrate(
        "export.xml",
        &collection(&[
            paper(30, &[]),
            paper(31, &[]),
            // 33 cites 32 itself, so 32 is not counted twice
            paper(32, &[]),
            paper(33, &[32]),
            merged_citing(34, 33, &[30, 32]),
        ]),
    )
    .await;

    let report = env.count_citations().await;
    assert_eq!(report.attributed, 1);
    assert_eq!(env.citation_count(30).await, Some(1));
    assert_eq!(env.citation_count(32).await, Some(1));
    assert_eq!(env.citation_count(31).await, Some(0));
}

#[tokio::test]
async fn test_unresolved_targets_are_reported() {
    let env = TestEnv::new().await;
    env.migrate("export.xml", &collection(&[paper(40, &[404, 405])]))
        .await;

    let report = env.count_citations().await;
    assert_eq!(report.unresolved_targets, 2);
    assert_eq!(env.citation_count(40).await, Some(0));
}

#[tokio::test]
async fn test_counts_survive_reindexing() {
    let env = TestEnv::new().await;
    env.migrate("export.xml", &collection(&[paper(50, &[]), paper(51, &[50])]))
        .await;
    env.count_citations().await;

    // A new revision of the cited record keeps its last computed count
    env.migrate("again.xml", &collection(&[paper(50, &[])])).await;
    assert_eq!(env.document(50).await.unwrap().version, 2);
    assert_eq!(env.citation_count(50).await, Some(1));
}

#[tokio::test]
async fn test_small_pages_and_batches() {
    let mut config = TomlConfig::default();
    config.citations.scan_page_size = 2;
    config.citations.bulk_batch_size = 2;
    let env = TestEnv::with_config(config).await;

    let mut records = vec![paper(60, &[])];
    records.extend((61..66).map(|recid| paper(recid, &[60])));
    env.migrate("export.xml", &collection(&records)).await;

    let report = env.count_citations().await;
    assert_eq!(report.scanned, 6);
    assert_eq!(report.written.indexed, 6);
    assert_eq!(env.citation_count(60).await, Some(5));
}

#[tokio::test]
async fn test_citations_of_merged_record_go_to_successor() {
    let env = TestEnv::new().await;
    env.migrate("initial.xml", &collection(&[paper(70, &[]), paper(71, &[])]))
        .await;
    env.migrate(
        "merge.xml",
        &collection(&[
            merged_citing(70, 71, &[]),
            paper(72, &[70]),
            // Cites both sides of the merge; counts once
            paper(73, &[70, 71]),
        ]),
    )
    .await;

    let report = env.count_citations().await;
    assert_eq!(report.unresolved_targets, 0);
    assert_eq!(env.citation_count(71).await, Some(2));
    assert_eq!(env.citation_count(70).await.unwrap_or(0), 0);
}

#[tokio::test]
async fn test_stale_count_is_reset_when_no_longer_cited() {
    let env = TestEnv::new().await;
    env.migrate("export.xml", &collection(&[paper(80, &[]), paper(81, &[80])]))
        .await;
    env.count_citations().await;
    assert_eq!(env.citation_count(80).await, Some(1));

    // Cited record is deleted and its only citer drops the reference
    let tombstone = marc(80, &["HEP"], &deleted());
    env.migrate("update.xml", &collection(&[tombstone, paper(81, &[])]))
        .await;

    let report = env.count_citations().await;
    assert_eq!(report.reset, 1);
    assert_eq!(env.citation_count(80).await, Some(0));
}
