//! Utility modules for bibrec-migrator

pub mod db_retry;
pub mod pool_monitor;

pub use db_retry::{retry_on_conflict, RetryPolicy, Retryable};
pub use pool_monitor::{begin_monitored, MonitoredTransaction};
