//! Canonical record model
//!
//! A canonical record is a schema-tagged JSON object (`RecordJson`). The
//! pipeline never reaches into it ad hoc: the accessors here are the only
//! places that know where identifiers, tombstone markers and references live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Record content: map of field name to JSON value
pub type RecordJson = Map<String, Value>;

/// Kind of bibliographic record
///
/// Each kind owns one JSON schema, one REST endpoint name, one collection
/// label and one numeric primary PID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Literature,
    Authors,
    Institutions,
    Experiments,
    Journals,
    Jobs,
    Conferences,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Literature,
        RecordKind::Authors,
        RecordKind::Institutions,
        RecordKind::Experiments,
        RecordKind::Journals,
        RecordKind::Jobs,
        RecordKind::Conferences,
    ];

    /// Primary PID type. All of them carry numeric values.
    pub fn pid_type(&self) -> &'static str {
        match self {
            RecordKind::Literature => "lit",
            RecordKind::Authors => "aut",
            RecordKind::Institutions => "ins",
            RecordKind::Experiments => "exp",
            RecordKind::Journals => "jou",
            RecordKind::Jobs => "job",
            RecordKind::Conferences => "con",
        }
    }

    /// Schema file name (without the `.json` suffix)
    pub fn schema_name(&self) -> &'static str {
        match self {
            RecordKind::Literature => "hep",
            RecordKind::Authors => "authors",
            RecordKind::Institutions => "institutions",
            RecordKind::Experiments => "experiments",
            RecordKind::Journals => "journals",
            RecordKind::Jobs => "jobs",
            RecordKind::Conferences => "conferences",
        }
    }

    /// REST endpoint segment used in `$ref` URLs
    pub fn endpoint(&self) -> &'static str {
        match self {
            RecordKind::Literature => "literature",
            RecordKind::Authors => "authors",
            RecordKind::Institutions => "institutions",
            RecordKind::Experiments => "experiments",
            RecordKind::Journals => "journals",
            RecordKind::Jobs => "jobs",
            RecordKind::Conferences => "conferences",
        }
    }

    /// Label written into `_collections`
    pub fn collection_label(&self) -> &'static str {
        match self {
            RecordKind::Literature => "Literature",
            RecordKind::Authors => "Authors",
            RecordKind::Institutions => "Institutions",
            RecordKind::Experiments => "Experiments",
            RecordKind::Journals => "Journals",
            RecordKind::Jobs => "Jobs",
            RecordKind::Conferences => "Conferences",
        }
    }

    pub fn from_pid_type(pid_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.pid_type() == pid_type)
    }

    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.endpoint() == endpoint)
    }

    /// Resolve a kind from a `$schema` value such as
    /// `http://host/schemas/records/hep.json`.
    pub fn from_schema(schema: &str) -> Option<Self> {
        let file = schema.rsplit('/').next()?;
        let name = file.strip_suffix(".json").unwrap_or(file);
        Self::ALL.into_iter().find(|k| k.schema_name() == name)
    }

    pub fn schema_url(&self, base_url: &str) -> String {
        format!(
            "{}/schemas/records/{}.json",
            base_url.trim_end_matches('/'),
            self.schema_name()
        )
    }
}

/// Whether values of this PID type are guaranteed to be numeric
pub fn is_numeric_pid_type(pid_type: &str) -> bool {
    RecordKind::from_pid_type(pid_type).is_some()
}

/// Reference to another record, as carried in a `{"$ref": ".../api/<endpoint>/<value>"}`
/// JSON reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub endpoint: String,
    pub value: String,
}

impl RecordRef {
    pub fn new(kind: RecordKind, value: impl Into<String>) -> Self {
        Self {
            endpoint: kind.endpoint().to_string(),
            value: value.into(),
        }
    }

    /// Parse the last two path segments of a `$ref` URL
    pub fn parse(url: &str) -> Option<Self> {
        let mut segments = url.trim_end_matches('/').rsplit('/');
        let value = segments.next()?.trim();
        let endpoint = segments.next()?.trim();
        if value.is_empty() || endpoint.is_empty() {
            return None;
        }
        Some(Self {
            endpoint: endpoint.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a `{"$ref": "..."}` JSON object
    pub fn from_json(value: &Value) -> Option<Self> {
        value.get("$ref").and_then(Value::as_str).and_then(Self::parse)
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_endpoint(&self.endpoint)
    }

    pub fn pid_type(&self) -> Option<&'static str> {
        self.kind().map(|k| k.pid_type())
    }

    pub fn to_url(&self, base_url: &str) -> String {
        format!(
            "{}/api/{}/{}",
            base_url.trim_end_matches('/'),
            self.endpoint,
            self.value
        )
    }

    pub fn to_json(&self, base_url: &str) -> Value {
        serde_json::json!({ "$ref": self.to_url(base_url) })
    }
}

/// Declared `control_number` of a record, if present and a positive integer
pub fn control_number(json: &RecordJson) -> Option<u64> {
    match json.get("control_number")? {
        Value::Number(n) => n.as_u64().filter(|v| *v > 0),
        Value::String(s) => s.trim().parse().ok().filter(|v: &u64| *v > 0),
        _ => None,
    }
}

pub fn schema_kind(json: &RecordJson) -> Option<RecordKind> {
    json.get("$schema")
        .and_then(Value::as_str)
        .and_then(RecordKind::from_schema)
}

pub fn is_deleted(json: &RecordJson) -> bool {
    json.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

/// Reference to the record that superseded this one
pub fn new_record_ref(json: &RecordJson) -> Option<RecordRef> {
    json.get("new_record").and_then(RecordRef::from_json)
}

/// Outbound references (`references[].record`) that carry a parseable `$ref`
pub fn outbound_references(json: &RecordJson) -> Vec<RecordRef> {
    json.get("references")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r.get("record"))
                .filter_map(RecordRef::from_json)
                .collect()
        })
        .unwrap_or_default()
}

/// A converted, schema-validated record as stored in `records_metadata`
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    /// Internal storage identity
    pub id: Uuid,
    /// Optimistic-concurrency counter, bumped on every committed change
    pub revision: i64,
    pub json: RecordJson,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn control_number(&self) -> Option<u64> {
        control_number(&self.json)
    }

    pub fn kind(&self) -> Option<RecordKind> {
        schema_kind(&self.json)
    }

    pub fn is_deleted(&self) -> bool {
        is_deleted(&self.json)
    }

    pub fn new_record(&self) -> Option<RecordRef> {
        new_record_ref(&self.json)
    }

    pub fn references(&self) -> Vec<RecordRef> {
        outbound_references(&self.json)
    }

    /// Reference pointing at this record, if its kind and number are known
    pub fn self_ref(&self) -> Option<RecordRef> {
        Some(RecordRef::new(self.kind()?, self.control_number()?.to_string()))
    }
}
