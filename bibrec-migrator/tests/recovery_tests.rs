//! Broken record recovery through the mirror

mod helpers;

use bibrec_common::RecordJson;
use bibrec_migrator::converter::{ConversionError, Converter, MarcXmlConverter};
use bibrec_migrator::db::mirror::{self, MirrorSelection};
use bibrec_migrator::pipeline::{write_broken_output, Source};
use helpers::*;
use std::sync::Arc;

/// Baseline converter plus a rule that rejects drafts
struct RejectDrafts(MarcXmlConverter);

impl Converter for RejectDrafts {
    fn convert(&self, raw: &[u8]) -> Result<RecordJson, ConversionError> {
        if String::from_utf8_lossy(raw).contains("Draft") {
            return Err(ConversionError::Rule {
                tag: "245".to_string(),
                reason: "draft titles are not accepted".to_string(),
            });
        }
        self.0.convert(raw)
    }
}

fn draft(recid: u64) -> String {
    marc(recid, &["HEP"], &title("Draft"))
}

#[tokio::test]
async fn test_recover_after_converter_fix() {
    let env = TestEnv::new().await;
    let path = env.write_export(
        "export.xml",
        collection(&[paper(1, &[]), draft(2), draft(3)]).as_bytes(),
    );

    let strict = env.pipeline_with(Arc::new(RejectDrafts(MarcXmlConverter::new(BASE_URL))));
    let summary = env
        .run(
            &strict,
            Source::File {
                path,
                mirror_only: false,
            },
        )
        .await;
    assert_eq!(summary.migrated, 1);
    assert_eq!(summary.failed, 2);

    let counts = mirror::counts(&env.pool).await.unwrap();
    assert_eq!((counts.valid, counts.invalid, counts.pending), (1, 2, 0));

    let errors = mirror::top_errors(&env.pool, 10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1, 2);
    assert!(errors[0].0.contains("draft titles"));

    // With the rule lifted, only the broken rows are re-driven
    let summary = env.remigrate(MirrorSelection::Unmigrated).await;
    assert_eq!(summary.records, 2);
    assert_eq!(summary.migrated, 2);
    assert!(mirror::broken(&env.pool).await.unwrap().is_empty());
    assert_eq!(env.literature(1).await.unwrap().revision, 1);
    assert!(env.literature(3).await.is_some());
}

#[tokio::test]
async fn test_recover_with_corrected_input() {
    let env = TestEnv::new().await;
    let broken = marc(7, &["HEP"], "");
    env.migrate("export.xml", &collection(&[paper(6, &[]), broken]))
        .await;
    assert_eq!(env.mirror_row(7).await.unwrap().valid, Some(false));

    // Staging the corrected record resets its outcome
    let staged = env.stage("fixed.xml", &collection(&[paper(7, &[])])).await;
    assert_eq!(staged.staged, 1);
    let row = env.mirror_row(7).await.unwrap();
    assert_eq!(row.valid, None);
    assert_eq!(row.error, None);

    let summary = env.remigrate(MirrorSelection::Unmigrated).await;
    assert_eq!(summary.migrated, 1);
    assert_eq!(env.mirror_row(7).await.unwrap().valid, Some(true));
    assert!(env.literature(7).await.is_some());
}

#[tokio::test]
async fn test_broken_output_file() {
    let env = TestEnv::new().await;
    env.migrate(
        "export.xml",
        &collection(&[paper(1, &[]), marc(2, &["HEP"], ""), marc(3, &["HEP"], "")]),
    )
    .await;

    let out = env.dir.path().join("broken.xml");
    let written = write_broken_output(&env.pool, &out).await.unwrap();
    assert_eq!(written, 2);

    let content = std::fs::read_to_string(&out).unwrap();
    assert!(content.starts_with("<collection>"));
    assert!(content.trim_end().ends_with("</collection>"));
    assert!(content.contains(r#"<controlfield tag="001">2</controlfield>"#));
    assert!(content.contains(r#"<controlfield tag="001">3</controlfield>"#));
    assert!(!content.contains(r#"<controlfield tag="001">1</controlfield>"#));

    // The output is itself a valid export
    let summary = env
        .run(
            &env.pipeline(),
            Source::File {
                path: out,
                mirror_only: true,
            },
        )
        .await;
    assert_eq!(summary.staged, 2);
}
