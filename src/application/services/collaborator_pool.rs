//! Collaborator Pool
//!
//! Bounds how many collaborator calls run at once and how long each may
//! take. A call that outlives its timeout is abandoned and reported as a
//! retryable `CollaboratorError::Timeout`; it never counts as a state change.

use crate::domain::errors::CollaboratorError;
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Concurrency and latency bounds for collaborator calls
#[derive(Debug, Clone, PartialEq)]
pub struct CollaboratorPoolConfig {
    pub max_concurrency: usize,
    pub call_timeout: Duration,
}

impl Default for CollaboratorPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollaboratorPool {
    permits: Arc<Semaphore>,
    config: CollaboratorPoolConfig,
}

impl CollaboratorPool {
    pub fn new(config: CollaboratorPoolConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &CollaboratorPoolConfig {
        &self.config
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs one call under a permit and the configured timeout.
    ///
    /// Waiting for a permit is not counted against the timeout.
    pub async fn call<T, Fut>(&self, collaborator: &str, call: Fut) -> Result<T, CollaboratorError>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CollaboratorError::PoolClosed)?;

        debug!("Calling {}", collaborator);
        match timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = self.config.call_timeout.as_millis() as u64;
                warn!("{} timed out after {}ms", collaborator, after_ms);
                Err(CollaboratorError::Timeout {
                    collaborator: collaborator.to_string(),
                    after_ms,
                })
            }
        }
    }

    /// Runs a batch of calls concurrently, at most `max_concurrency` at a
    /// time. Results come back in input order.
    pub async fn call_all<T, Fut>(
        &self,
        collaborator: &str,
        calls: Vec<Fut>,
    ) -> Vec<Result<T, CollaboratorError>>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        join_all(calls.into_iter().map(|call| self.call(collaborator, call))).await
    }

    /// Rejects every waiting and future call with `PoolClosed`.
    pub fn close(&self) {
        self.permits.close();
    }
}
