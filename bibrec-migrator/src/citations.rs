//! Citation aggregator
//!
//! Corpus-wide batch job, run only once a migration has fully drained.
//!
//! Phase A scans every indexed document, resolves each cited (pid type,
//! value) through the PID store and its redirects to the object that
//! currently answers for it, and counts how many distinct citing records
//! reference each object. A record citing both a merged-away record and its
//! successor counts once. Phase B writes `citation_count` back as bulk field
//! updates. Every live literature document, and every document that carried
//! a non-zero count before this run, gets a value, zero when uncited, so each
//! run fully overwrites the previous one.

use crate::db::pids;
use crate::index::{IndexReport, IndexedDocument, IndexerBridge};
use bibrec_common::config::{CitationsConfig, SupersededCiting};
use bibrec_common::{record, RecordKind, RecordRef, Result};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cited record identity: (pid type, numeric value)
type Target = (&'static str, u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CitationReport {
    pub scanned: usize,
    /// Records whose references were counted
    pub citing: usize,
    /// Superseded records whose references went to a successor
    pub attributed: usize,
    /// References skipped for an unknown endpoint or non-numeric value
    pub skipped_refs: usize,
    /// Distinct cited targets with no PID
    pub unresolved_targets: usize,
    /// Documents whose earlier count was reset because nothing cites them now
    pub reset: usize,
    pub written: IndexReport,
}

/// Result of the counting phase
#[derive(Debug, Default)]
struct Tally {
    counts: HashMap<Uuid, u64>,
    live_literature: Vec<Uuid>,
    /// Documents carrying a non-zero count from an earlier run
    previously_counted: Vec<Uuid>,
}

/// Target to object uuid, following redirects; cached per run
#[derive(Default)]
struct TargetResolver {
    cache: HashMap<Target, Option<Uuid>>,
}

impl TargetResolver {
    async fn resolve_all(
        &mut self,
        conn: &mut SqliteConnection,
        targets: &HashSet<Target>,
    ) -> Result<HashSet<Uuid>> {
        let mut resolved = HashSet::with_capacity(targets.len());
        for target in targets {
            if let Some(uuid) = self.resolve(conn, *target).await? {
                resolved.insert(uuid);
            }
        }
        Ok(resolved)
    }

    async fn resolve(&mut self, conn: &mut SqliteConnection, target: Target) -> Result<Option<Uuid>> {
        if let Some(cached) = self.cache.get(&target) {
            return Ok(*cached);
        }

        let (pid_type, value) = target;
        let uuid = pids::resolve(conn, pid_type, &value.to_string())
            .await?
            .map(|(_, uuid)| uuid);
        if uuid.is_none() {
            debug!(pid_type, value, "Cited record has no PID");
        }

        self.cache.insert(target, uuid);
        Ok(uuid)
    }

    fn unresolved(&self) -> usize {
        self.cache.values().filter(|uuid| uuid.is_none()).count()
    }
}

pub struct CitationAggregator {
    pool: SqlitePool,
    bridge: IndexerBridge,
    config: CitationsConfig,
}

impl CitationAggregator {
    pub fn new(pool: SqlitePool, bridge: IndexerBridge, config: CitationsConfig) -> Self {
        Self {
            pool,
            bridge,
            config,
        }
    }

    pub async fn run(&self) -> Result<CitationReport> {
        let start = Instant::now();
        let mut report = CitationReport::default();

        let tally = self.count(&mut report).await?;
        info!(
            scanned = report.scanned,
            targets = tally.counts.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Citation counting finished"
        );

        let updates = overwrite_set(tally, &mut report);
        report.written = self
            .bridge
            .update_citation_counts(&updates, self.config.bulk_batch_size)
            .await?;

        info!(
            updated = report.written.indexed,
            failed = report.written.failed,
            reset = report.reset,
            skipped_refs = report.skipped_refs,
            unresolved = report.unresolved_targets,
            elapsed_ms = start.elapsed().as_millis(),
            "Citation counts written"
        );

        Ok(report)
    }

    /// Phase A
    async fn count(&self, report: &mut CitationReport) -> Result<Tally> {
        let mut tally = Tally::default();
        let mut resolver = TargetResolver::default();
        let mut after = None;

        loop {
            let page = self
                .bridge
                .index()
                .scan(after, self.config.scan_page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            let mut conn = self.pool.acquire().await?;
            for doc in &page {
                report.scanned += 1;
                if doc.citation_count().is_some_and(|count| count > 0) {
                    tally.previously_counted.push(doc.id);
                }

                let cited = if !record::is_deleted(&doc.source) {
                    if record::schema_kind(&doc.source) == Some(RecordKind::Literature) {
                        tally.live_literature.push(doc.id);
                    }
                    report.citing += 1;
                    let targets = targets_of(doc, report);
                    resolver.resolve_all(&mut conn, &targets).await?
                } else {
                    match self
                        .superseded_contribution(&mut conn, &mut resolver, doc, report)
                        .await?
                    {
                        Some(cited) => {
                            report.attributed += 1;
                            cited
                        }
                        None => continue,
                    }
                };

                for uuid in cited {
                    *tally.counts.entry(uuid).or_insert(0) += 1;
                }
            }

            debug!(scanned = report.scanned, "Citation scan page done");
        }

        report.unresolved_targets = resolver.unresolved();
        Ok(tally)
    }

    /// Objects a deleted record still counts toward, per configuration
    ///
    /// Soft-deleted records never contribute. Superseded ones contribute only
    /// under `AttributeToSuccessor`, and then only for objects their live
    /// successor does not already cite.
    async fn superseded_contribution(
        &self,
        conn: &mut SqliteConnection,
        resolver: &mut TargetResolver,
        doc: &IndexedDocument,
        report: &mut CitationReport,
    ) -> Result<Option<HashSet<Uuid>>> {
        if self.config.superseded_citing == SupersededCiting::Exclude {
            return Ok(None);
        }

        let chain = pids::redirect_chain(conn, doc.id).await?;
        let Some(&successor_id) = chain.last().filter(|_| chain.len() > 1) else {
            return Ok(None);
        };

        let Some(successor) = self.bridge.index().get(successor_id).await? else {
            warn!(record = %doc.id, successor = %successor_id, "Successor not indexed");
            return Ok(None);
        };
        if record::is_deleted(&successor.source) {
            return Ok(None);
        }

        // The successor's own references are counted when it is scanned
        let own_targets = targets_of(&successor, &mut CitationReport::default());
        let own = resolver.resolve_all(conn, &own_targets).await?;
        let targets = targets_of(doc, report);
        let mut cited = resolver.resolve_all(conn, &targets).await?;
        cited.retain(|uuid| !own.contains(uuid));
        Ok(Some(cited))
    }
}

/// Phase B input: every count, plus zero for live literature and for
/// documents whose earlier count no longer holds
fn overwrite_set(tally: Tally, report: &mut CitationReport) -> Vec<(Uuid, u64)> {
    let mut updates: BTreeMap<Uuid, u64> =
        tally.live_literature.into_iter().map(|id| (id, 0)).collect();

    for id in tally.previously_counted {
        if !tally.counts.contains_key(&id) {
            report.reset += 1;
        }
        updates.insert(id, 0);
    }

    updates.extend(tally.counts);
    updates.into_iter().collect()
}

/// Distinct numeric targets referenced by one document
fn targets_of(doc: &IndexedDocument, report: &mut CitationReport) -> HashSet<Target> {
    let mut targets = HashSet::new();
    for reference in record::outbound_references(&doc.source) {
        match target_of(&reference) {
            Some(target) => {
                targets.insert(target);
            }
            None => report.skipped_refs += 1,
        }
    }
    targets
}

fn target_of(reference: &RecordRef) -> Option<Target> {
    let pid_type = reference.pid_type()?;
    let value = reference.value.parse::<u64>().ok()?;
    Some((pid_type, value))
}
