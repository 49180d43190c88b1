//! Legacy record conversion
//!
//! The pipeline only depends on the [`Converter`] contract: raw legacy bytes
//! in, canonical JSON out. [`MarcXmlConverter`] is the baseline rule table
//! shipped with the migrator; richer rule tables plug in behind the same trait.

use crate::marcxml::{MarcRecord, MarcXmlError};
use bibrec_common::{RecordJson, RecordKind, RecordRef};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error(transparent)]
    Parse(#[from] MarcXmlError),

    #[error("conversion rule failed on {tag}: {reason}")]
    Rule { tag: String, reason: String },
}

/// Maps one raw legacy record to canonical JSON
pub trait Converter: Send + Sync {
    fn convert(&self, raw: &[u8]) -> Result<RecordJson, ConversionError>;
}

/// Record kind from `980__a` collection memberships
///
/// Checked in a fixed priority order; a record tagged both `INSTITUTION` and
/// `HEP` is an institution. Anything unmatched is literature.
pub fn kind_for_collections<S: AsRef<str>>(collections: &[S]) -> RecordKind {
    let has = |names: &[&str]| {
        collections
            .iter()
            .any(|c| names.iter().any(|n| c.as_ref().eq_ignore_ascii_case(n)))
    };

    if has(&["INSTITUTION"]) {
        RecordKind::Institutions
    } else if has(&["EXPERIMENT"]) {
        RecordKind::Experiments
    } else if has(&["JOURNALS", "JOURNALSNEW"]) {
        RecordKind::Journals
    } else if has(&["HEPNAMES"]) {
        RecordKind::Authors
    } else if has(&["JOB", "JOBHIDDEN"]) {
        RecordKind::Jobs
    } else if has(&["CONFERENCES"]) {
        RecordKind::Conferences
    } else {
        RecordKind::Literature
    }
}

/// Baseline MARCXML rule table
#[derive(Debug, Clone)]
pub struct MarcXmlConverter {
    base_url: String,
}

impl MarcXmlConverter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn record_ref(&self, kind: RecordKind, tag: &str, value: &str) -> Result<Value, ConversionError> {
        let value = value.trim();
        if value.parse::<u64>().map_or(true, |v| v == 0) {
            return Err(ConversionError::Rule {
                tag: tag.to_string(),
                reason: format!("{:?} is not a record number", value),
            });
        }
        Ok(RecordRef::new(kind, value).to_json(&self.base_url))
    }

    fn literature_fields(&self, marc: &MarcRecord, json: &mut RecordJson) {
        let titles = titles_from(marc, "245");
        if !titles.is_empty() {
            json.insert("titles".to_string(), Value::Array(titles));
        }

        let authors: Vec<Value> = marc
            .fields("100")
            .chain(marc.fields("700"))
            .filter_map(|f| f.get('a'))
            .filter(|a| !a.is_empty())
            .map(|a| json!({ "full_name": a }))
            .collect();
        if !authors.is_empty() {
            json.insert("authors".to_string(), Value::Array(authors));
        }

        let eprints: Vec<Value> = marc
            .fields("037")
            .filter(|f| f.get('9').is_some_and(|s| s.eq_ignore_ascii_case("arxiv")))
            .filter_map(|f| f.get('a'))
            .filter(|a| !a.is_empty())
            .map(|a| json!({ "value": a.trim_start_matches("arXiv:") }))
            .collect();
        if !eprints.is_empty() {
            json.insert("arxiv_eprints".to_string(), Value::Array(eprints));
        }
    }

    fn references(&self, marc: &MarcRecord) -> Result<Vec<Value>, ConversionError> {
        let mut references = Vec::new();
        for field in marc.fields_with("999", 'C', '5') {
            let mut entry = serde_json::Map::new();
            if let Some(recid) = field.get('0') {
                entry.insert(
                    "record".to_string(),
                    self.record_ref(RecordKind::Literature, "999C5", recid)?,
                );
            }
            let misc: Vec<&str> = field
                .get_all('m')
                .chain(field.get_all('r'))
                .filter(|s| !s.is_empty())
                .collect();
            if !misc.is_empty() {
                entry.insert("reference".to_string(), json!({ "misc": misc }));
            }
            if !entry.is_empty() {
                references.push(Value::Object(entry));
            }
        }
        Ok(references)
    }
}

impl Converter for MarcXmlConverter {
    fn convert(&self, raw: &[u8]) -> Result<RecordJson, ConversionError> {
        let marc = MarcRecord::parse(raw)?;
        let recid = marc.recid()?;
        let kind = kind_for_collections(&marc.collections());

        let mut json = RecordJson::new();
        json.insert("$schema".to_string(), json!(kind.schema_url(&self.base_url)));
        json.insert("_collections".to_string(), json!([kind.collection_label()]));
        json.insert("control_number".to_string(), json!(recid));

        let deleted = marc
            .fields("980")
            .flat_map(|f| f.get_all('c'))
            .any(|c| c.eq_ignore_ascii_case("DELETED"));
        if deleted {
            json.insert("deleted".to_string(), Value::Bool(true));
        }

        if let Some(successor) = marc.fields("981").find_map(|f| f.get('a')) {
            json.insert(
                "new_record".to_string(),
                self.record_ref(kind, "981", successor)?,
            );
        }

        match kind {
            RecordKind::Literature => self.literature_fields(&marc, &mut json),
            RecordKind::Authors => {
                if let Some(name) = first_value(&marc, "100", 'a') {
                    json.insert("name".to_string(), json!({ "value": name }));
                }
            }
            RecordKind::Institutions => {
                if let Some(icn) = first_value(&marc, "110", 'a') {
                    json.insert("legacy_ICN".to_string(), json!(icn));
                }
            }
            RecordKind::Experiments => {
                if let Some(name) = first_value(&marc, "119", 'a') {
                    json.insert("legacy_name".to_string(), json!(name));
                }
            }
            RecordKind::Journals => {
                if let Some(title) = first_value(&marc, "130", 'a') {
                    json.insert("journal_title".to_string(), json!({ "title": title }));
                }
            }
            RecordKind::Conferences => {
                let titles = titles_from(&marc, "111");
                if !titles.is_empty() {
                    json.insert("titles".to_string(), Value::Array(titles));
                }
            }
            RecordKind::Jobs => {
                let position =
                    first_value(&marc, "270", 'a').or_else(|| first_value(&marc, "245", 'a'));
                if let Some(position) = position {
                    json.insert("position".to_string(), json!(position));
                }
            }
        }

        let references = self.references(&marc)?;
        if !references.is_empty() {
            json.insert("references".to_string(), Value::Array(references));
        }

        Ok(json)
    }
}

fn first_value<'a>(marc: &'a MarcRecord, tag: &'a str, code: char) -> Option<&'a str> {
    marc.fields(tag)
        .filter_map(|f| f.get(code))
        .find(|v| !v.is_empty())
}

fn titles_from(marc: &MarcRecord, tag: &str) -> Vec<Value> {
    marc.fields(tag)
        .filter_map(|f| f.get('a'))
        .filter(|t| !t.is_empty())
        .map(|t| json!({ "title": t }))
        .collect()
}
