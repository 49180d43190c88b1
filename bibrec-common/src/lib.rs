//! # Bibrec Common Library
//!
//! Shared code for the bibliographic record migrator:
//! - Error type and `Result` alias
//! - Configuration loading and root folder resolution
//! - Database initialization (mirror, records, PID and redirect tables)
//! - Canonical record model and persistent identifier types

pub mod config;
pub mod db;
pub mod error;
pub mod pid;
pub mod record;

pub use error::{Error, Result};
pub use pid::{PersistentIdentifier, PidStatus};
pub use record::{CanonicalRecord, RecordJson, RecordKind, RecordRef};
