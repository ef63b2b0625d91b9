use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::capabilities::{Connectivity, NoConnectivitySignal};
use crate::{
    calculate_retry_delay, generate_jitter, ViewerError, ViewerResult, BASE_RETRY_DELAY_MS,
    JITTER_MAX_MS, MAX_RETRY_DELAY_MS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, BASE_RETRY_DELAY_MS)
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            max_jitter_ms: JITTER_MAX_MS,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, max_jitter_ms: u64) -> Self {
        self.max_jitter_ms = max_jitter_ms;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Wait after the 1-based `attempt` failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let jitter = generate_jitter(self.max_jitter_ms);
        Duration::from_millis(calculate_retry_delay(
            self.base_delay_ms,
            attempt,
            self.max_delay_ms,
            jitter,
        ))
    }
}

/// Retry-with-backoff around any fallible async operation.
///
/// Errors whose kind is not retryable (not found, forbidden, corrupt,
/// validation) are returned unchanged after the first attempt. Retryable
/// errors are retried until `max_attempts`, after which the last one is
/// wrapped in [`ViewerError::RetriesExhausted`]. Before every retry the host
/// connectivity signal is consulted and a clearly offline host fails fast.
#[derive(Clone)]
pub struct RetryingFetcher {
    connectivity: Arc<dyn Connectivity>,
}

impl Default for RetryingFetcher {
    fn default() -> Self {
        Self::new(Arc::new(NoConnectivitySignal))
    }
}

impl std::fmt::Debug for RetryingFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingFetcher")
            .field("online", &self.connectivity.is_online())
            .finish()
    }
}

impl RetryingFetcher {
    pub fn new(connectivity: Arc<dyn Connectivity>) -> Self {
        Self { connectivity }
    }

    #[instrument(skip(self, policy, operation), fields(max_attempts = policy.max_attempts))]
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> ViewerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ViewerResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!(attempt, error = %error, "not retryable");
                return Err(error);
            }

            if attempt >= max_attempts {
                counter!("retry.exhausted", "operation" => label.to_string()).increment(1);
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(ViewerError::RetriesExhausted {
                    operation: label.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = policy.delay_after(attempt);
            counter!("retry.attempts", "operation" => label.to_string()).increment(1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;

            if self.connectivity.is_online() == Some(false) {
                warn!(attempt, "host reports offline, giving up");
                return Err(ViewerError::Offline {
                    operation: label.to_string(),
                });
            }

            attempt += 1;
        }
    }
}

/// Races `future` against a timer. On expiry the future is dropped, which
/// cancels whatever it was awaiting, and a timeout naming `label` is returned.
pub async fn with_timeout<T, Fut>(future: Fut, limit: Duration, label: &str) -> ViewerResult<T>
where
    Fut: Future<Output = ViewerResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => {
            counter!("retry.timeouts", "operation" => label.to_string()).increment(1);
            Err(ViewerError::Timeout {
                operation: label.to_string(),
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}
