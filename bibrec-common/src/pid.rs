//! Persistent identifier types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Object type recorded on PIDs that point at canonical records
pub const RECORD_OBJECT_TYPE: &str = "rec";

/// Lifecycle state of a persistent identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidStatus {
    Reserved,
    Registered,
    Deleted,
    Redirected,
}

impl PidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PidStatus::Reserved => "reserved",
            PidStatus::Registered => "registered",
            PidStatus::Deleted => "deleted",
            PidStatus::Redirected => "redirected",
        }
    }
}

impl fmt::Display for PidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PidStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reserved" => Ok(PidStatus::Reserved),
            "registered" => Ok(PidStatus::Registered),
            "deleted" => Ok(PidStatus::Deleted),
            "redirected" => Ok(PidStatus::Redirected),
            other => Err(Error::InvalidInput(format!("Unknown PID status: {}", other))),
        }
    }
}

/// A (type, value) pair uniquely naming one canonical object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentIdentifier {
    /// Row id in `pidstore_pid`
    pub id: i64,
    pub pid_type: String,
    pub pid_value: String,
    pub object_type: Option<String>,
    pub object_uuid: Option<Uuid>,
    pub status: PidStatus,
}

impl PersistentIdentifier {
    pub fn is_registered(&self) -> bool {
        self.status == PidStatus::Registered
    }
}

impl fmt::Display for PersistentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid_type, self.pid_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            PidStatus::Reserved,
            PidStatus::Registered,
            PidStatus::Deleted,
            PidStatus::Redirected,
        ] {
            assert_eq!(status.as_str().parse::<PidStatus>().unwrap(), status);
        }
        assert!("R".parse::<PidStatus>().is_err());
    }
}
