//! Test Helper Utilities
//!
//! Shared fixtures for bibrec-migrator integration tests: a throwaway
//! database + index, MARCXML builders, and shortcuts for running the
//! pipeline and the citation job in join mode.

#![allow(dead_code)]

use bibrec_common::config::TomlConfig;
use bibrec_common::PersistentIdentifier;
use bibrec_migrator::citations::{CitationAggregator, CitationReport};
use bibrec_migrator::converter::{Converter, MarcXmlConverter};
use bibrec_migrator::db::mirror::{self, MirrorRow, MirrorSelection};
use bibrec_migrator::db::{pids, records};
use bibrec_migrator::index::{IndexedDocument, IndexerBridge, SearchIndex, SqliteIndex};
use bibrec_migrator::pipeline::{Dispatch, MigrationPipeline, RunOptions, RunOutcome, RunSummary, Source};
use bibrec_common::CanonicalRecord;
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::SqlitePool;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const BASE_URL: &str = "http://localhost:5000";

/// Database, index and configuration for one test
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub index: Arc<SqliteIndex>,
    pub config: TomlConfig,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(TomlConfig::default()).await
    }

    pub async fn with_config(config: TomlConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let pool = bibrec_common::db::init_database(&dir.path().join("bibrec.db"))
            .await
            .unwrap();
        let index = Arc::new(SqliteIndex::open(pool.clone()).await.unwrap());
        Self {
            dir,
            pool,
            index,
            config,
        }
    }

    pub fn pipeline(&self) -> MigrationPipeline {
        self.pipeline_with(Arc::new(MarcXmlConverter::new(BASE_URL)))
    }

    pub fn pipeline_with(&self, converter: Arc<dyn Converter>) -> MigrationPipeline {
        let index: Arc<dyn SearchIndex> = self.index.clone();
        MigrationPipeline::new(self.pool.clone(), converter, index, &self.config)
    }

    /// Write an export file into the test directory
    pub fn write_export(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub async fn run(&self, pipeline: &MigrationPipeline, source: Source) -> RunSummary {
        let options = RunOptions {
            dispatch: Dispatch::Join,
            force: false,
        };
        match pipeline.run(source, options).await.unwrap() {
            RunOutcome::Completed(summary) => summary,
            RunOutcome::Detached(_) => panic!("join dispatch returned a handle"),
        }
    }

    /// Migrate an export body in join mode with the baseline converter
    pub async fn migrate(&self, name: &str, body: &str) -> RunSummary {
        let path = self.write_export(name, body.as_bytes());
        self.run(
            &self.pipeline(),
            Source::File {
                path,
                mirror_only: false,
            },
        )
        .await
    }

    pub async fn stage(&self, name: &str, body: &str) -> RunSummary {
        let path = self.write_export(name, body.as_bytes());
        self.run(
            &self.pipeline(),
            Source::File {
                path,
                mirror_only: true,
            },
        )
        .await
    }

    pub async fn remigrate(&self, selection: MirrorSelection) -> RunSummary {
        self.run(&self.pipeline(), Source::Mirror(selection)).await
    }

    pub async fn count_citations(&self) -> CitationReport {
        let index: Arc<dyn SearchIndex> = self.index.clone();
        CitationAggregator::new(
            self.pool.clone(),
            IndexerBridge::new(index),
            self.config.citations.clone(),
        )
        .run()
        .await
        .unwrap()
    }

    pub async fn pid(&self, pid_type: &str, value: &str) -> Option<PersistentIdentifier> {
        let mut conn = self.pool.acquire().await.unwrap();
        pids::get(&mut conn, pid_type, value).await.unwrap()
    }

    /// Canonical record owning `lit:<recid>`
    pub async fn literature(&self, recid: u64) -> Option<CanonicalRecord> {
        let uuid = self.pid("lit", &recid.to_string()).await?.object_uuid?;
        let mut conn = self.pool.acquire().await.unwrap();
        records::load(&mut conn, uuid).await.unwrap()
    }

    pub async fn document(&self, recid: u64) -> Option<IndexedDocument> {
        let uuid = self.pid("lit", &recid.to_string()).await?.object_uuid?;
        self.index.get(uuid).await.unwrap()
    }

    pub async fn citation_count(&self, recid: u64) -> Option<u64> {
        self.document(recid).await?.citation_count()
    }

    pub async fn mirror_row(&self, recid: u64) -> Option<MirrorRow> {
        mirror::get(&self.pool, recid).await.unwrap()
    }

    pub async fn record_count(&self) -> i64 {
        let mut conn = self.pool.acquire().await.unwrap();
        records::count(&mut conn).await.unwrap()
    }

    pub async fn pid_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM pidstore_pid")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

/// One MARCXML record with a `980__a` per collection and extra raw fields
pub fn marc(recid: u64, collections: &[&str], fields: &str) -> String {
    let collections: String = collections
        .iter()
        .map(|c| {
            format!(
                r#"<datafield tag="980" ind1=" " ind2=" "><subfield code="a">{}</subfield></datafield>"#,
                c
            )
        })
        .collect();
    format!(
        r#"<record><controlfield tag="001">{}</controlfield>{}{}</record>"#,
        recid, fields, collections
    )
}

pub fn title(text: &str) -> String {
    format!(
        r#"<datafield tag="245" ind1=" " ind2=" "><subfield code="a">{}</subfield></datafield>"#,
        text
    )
}

pub fn cites(recid: u64) -> String {
    format!(
        r#"<datafield tag="999" ind1="C" ind2="5"><subfield code="0">{}</subfield></datafield>"#,
        recid
    )
}

pub fn deleted() -> String {
    r#"<datafield tag="980" ind1=" " ind2=" "><subfield code="c">DELETED</subfield></datafield>"#
        .to_string()
}

pub fn superseded_by(recid: u64) -> String {
    format!(
        r#"<datafield tag="981" ind1=" " ind2=" "><subfield code="a">{}</subfield></datafield>"#,
        recid
    )
}

/// Literature record with a title and the given citations
pub fn paper(recid: u64, references: &[u64]) -> String {
    let refs: String = references.iter().map(|r| cites(*r)).collect();
    marc(recid, &["HEP"], &format!("{}{}", title("Paper"), refs))
}

pub fn collection(records: &[String]) -> String {
    format!("<collection>\n{}\n</collection>\n", records.join("\n"))
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}
