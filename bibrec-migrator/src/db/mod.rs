//! Database access for the migration core
//!
//! Every function takes the connection it should run on, so callers decide
//! whether a statement joins a per-record transaction or runs on its own.

pub mod mirror;
pub mod pids;
pub mod records;

use bibrec_common::{Error, Result};
use uuid::Uuid;

/// Parse a uuid column value
pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Corrupt uuid {:?}: {}", value, e)))
}
