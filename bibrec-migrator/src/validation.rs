//! Canonical record validation
//!
//! Applied once, at the upsert boundary. Nothing downstream re-checks
//! structure, so every accessor in `bibrec_common::record` may assume the
//! shapes enforced here.

use bibrec_common::{record, RecordJson, RecordKind};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("$schema is missing or names no known record kind")]
    UnknownSchema,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("{kind} record is missing required field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

fn invalid(field: impl Into<String>, reason: &str) -> ValidationError {
    ValidationError::InvalidField {
        field: field.into(),
        reason: reason.to_string(),
    }
}

/// Required field per kind, as a JSON path
fn required_field(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::Literature => &["titles"],
        RecordKind::Authors => &["name", "value"],
        RecordKind::Institutions => &["legacy_ICN"],
        RecordKind::Experiments => &["legacy_name"],
        RecordKind::Journals => &["journal_title", "title"],
        RecordKind::Conferences => &["titles"],
        RecordKind::Jobs => &["position"],
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

fn lookup<'a>(json: &'a RecordJson, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter().try_fold(json.get(*first)?, |value, key| value.get(*key))
}

fn check_ref(value: &Value, field: String) -> Result<(), ValidationError> {
    match value.get("$ref") {
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(invalid(field, "$ref must be a string")),
        None => Err(invalid(field, "expected an object with $ref")),
    }
}

/// Validate a canonical record and return its kind
pub fn validate(json: &RecordJson) -> Result<RecordKind, ValidationError> {
    let kind = record::schema_kind(json).ok_or(ValidationError::UnknownSchema)?;

    match json.get("_collections") {
        None => {}
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
        Some(_) => return Err(invalid("_collections", "must be an array of strings")),
    }

    if let Some(value) = json.get("control_number") {
        if record::control_number(json).is_none() {
            return Err(invalid(
                "control_number",
                &format!("{} is not a positive integer", value),
            ));
        }
    }

    if let Some(value) = json.get("deleted") {
        if !value.is_boolean() {
            return Err(invalid("deleted", "must be a boolean"));
        }
    }

    if let Some(value) = json.get("new_record") {
        check_ref(value, "new_record".to_string())?;
    }

    if let Some(value) = json.get("references") {
        let refs = value
            .as_array()
            .ok_or_else(|| invalid("references", "must be an array"))?;
        for (i, reference) in refs.iter().enumerate() {
            if let Some(target) = reference.get("record") {
                check_ref(target, format!("references[{}].record", i))?;
            }
        }
    }

    if !record::is_deleted(json) {
        let path = required_field(kind);
        if !is_present(lookup(json, path)) {
            return Err(ValidationError::MissingField {
                kind: kind.schema_name(),
                field: path[0],
            });
        }
    }

    Ok(kind)
}
