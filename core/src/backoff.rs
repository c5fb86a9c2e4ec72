use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FetchConfig;

/// Attempt ceiling and delay bounds for one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
        )
    }
}

/// Doubling delays without jitter: base, 2*base, 4*base ... capped at `max_delay`.
pub fn create_backoff(policy: &RetryPolicy) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: policy.base_delay,
        initial_interval: policy.base_delay,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: policy.max_delay,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(operation, policy, operation_name, |_| true).await
}

/// Like [`retry_with_backoff`], but errors for which `retryable` returns
/// false are returned at once.
pub async fn retry_with_backoff_if<F, Fut, T, E, R>(
    operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    retry_with_hints(operation, policy, operation_name, retryable, |_| None).await
}

/// Like [`retry_with_backoff_if`]. An error can also name a minimum wait
/// (a server's Retry-After), which lengthens the next delay but never shortens it.
pub async fn retry_with_hints<F, Fut, T, E, R, H>(
    mut operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: R,
    retry_after: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
{
    let mut backoff = create_backoff(policy);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !retryable(&e) {
                    debug!(operation = operation_name, error = %e, "Error is not retryable");
                    return Err(e);
                }

                if attempts >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                if let Some(delay) = backoff.next_backoff() {
                    let duration = retry_after(&e).map_or(delay, |hint| hint.max(delay));
                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        retry_after_ms = duration.as_millis(),
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Backoff exhausted"
                    );
                    return Err(e);
                }
            }
        }
    }
}
