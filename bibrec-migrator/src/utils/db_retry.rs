//! Database Retry Logic
//!
//! Exponential backoff for per-record units of work that lose an
//! optimistic-concurrency race, hit SQLite lock contention, or collide on a
//! PID uniqueness constraint with a concurrent writer.

use bibrec_common::config::MigratorConfig;
use std::time::{Duration, Instant};

/// Errors that may succeed when the whole operation is replayed
pub trait Retryable: Sized {
    fn is_retryable(&self) -> bool;

    /// Final error once the retry budget is spent
    fn exhausted(self, _attempts: u32) -> Self {
        self
    }
}

/// Plain store errors only retry on lock contention
impl Retryable for bibrec_common::Error {
    fn is_retryable(&self) -> bool {
        self.is_lock_contention()
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl From<&MigratorConfig> for RetryPolicy {
    fn from(config: &MigratorConfig) -> Self {
        Self {
            max_attempts: config.max_conflict_retries.max(1),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        }
    }
}

/// Retry an operation with exponential backoff while its error is retryable.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If the error is retryable and attempts remain: log WARN, backoff, retry
/// 4. If retryable but the budget is spent: log ERROR, return `exhausted` error
/// 5. Any other error is returned immediately (no retry)
///
/// Backoff doubles from `initial_backoff`, capped at `max_backoff`.
pub async fn retry_on_conflict<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let start_time = Instant::now();
    let mut attempt = 0u32;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        if attempt > 1 {
            tracing::debug!(operation = operation_name, attempt, "Retrying database operation");
        }

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after significant retry period (>2s)"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        error = %err,
                        "Database operation failed: retry budget exhausted"
                    );
                    return Err(err.exhausted(attempt));
                }

                let delay = backoff.min(policy.max_backoff);

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis(),
                    error = %err,
                    "Concurrent write detected, will retry after backoff"
                );

                tokio::time::sleep(delay).await;

                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }
}
