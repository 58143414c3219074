/// Retry with exponential backoff
///
/// Transient store and transport failures are retried with a capped,
/// doubling delay. An operation is only considered failed once its retries
/// are exhausted; non-transient errors are returned immediately.

use crate::domain::errors::{BusError, CollaboratorError, LedgerError, StoreError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Errors that can tell a retryable failure from a permanent one.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Retryable for LedgerError {
    fn is_transient(&self) -> bool {
        LedgerError::is_transient(self)
    }
}

impl Retryable for BusError {
    fn is_transient(&self) -> bool {
        BusError::is_transient(self)
    }
}

impl Retryable for CollaboratorError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Internal backoff state
#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_delay: initial_delay,
        }
    }

    /// Returns the delay to wait before the next attempt.
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.current_delay * 2, max_delay);
        delay
    }
}

/// Runs `operation` until it succeeds, fails permanently, or exhausts
/// `policy.max_attempts`.
///
/// # Arguments
/// * `operation_name` - Name used in log lines
/// * `policy` - Attempt count and delay bounds
/// * `operation` - Produces one attempt per call
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut state = BackoffState::new(policy.initial_delay);
    let max_attempts = policy.max_attempts.max(1);

    loop {
        match operation().await {
            Ok(value) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Operation '{}' recovered after {} failures",
                        operation_name, state.consecutive_failures
                    );
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                let delay = state.record_failure(policy.max_delay);
                if state.consecutive_failures >= max_attempts {
                    error!(
                        "Operation '{}' failed after {} attempts: {}",
                        operation_name, state.consecutive_failures, e
                    );
                    return Err(e);
                }
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation_name, state.consecutive_failures, max_attempts, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
