//! Run-level errors for bibrec-migrator
//!
//! Per-record failures never surface here; they end up in the mirror table.
//! A `PipelineError` means the run as a whole could not continue.

use crate::splitter::SplitError;
use crate::upsert::UpsertError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Refused to run in a non-production-safe configuration
    #[error("Refusing to run: {0}")]
    SafetyCheck(String),

    #[error(transparent)]
    Split(#[from] SplitError),

    /// The relational store or index backend is unreachable
    #[error("Store unavailable: {0}")]
    Store(#[from] bibrec_common::Error),

    #[error("Store unavailable during upsert: {0}")]
    Upsert(UpsertError),

    /// A chunk task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl PipelineError {
    pub fn is_safety_refusal(&self) -> bool {
        matches!(self, PipelineError::SafetyCheck(_))
    }
}

/// Result type for pipeline runs
pub type PipelineResult<T> = Result<T, PipelineError>;
