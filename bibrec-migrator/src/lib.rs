//! bibrec-migrator library interface
//!
//! Legacy record migration: split an export into raw records, convert each
//! one to canonical JSON, reconcile identifiers and tombstones, index the
//! result, and recompute citation counts over the whole corpus.

pub mod chunker;
pub mod citations;
pub mod converter;
pub mod db;
pub mod error;
pub mod index;
pub mod marcxml;
pub mod pipeline;
pub mod splitter;
pub mod upsert;
pub mod utils;
pub mod validation;

pub use crate::error::{PipelineError, PipelineResult};
