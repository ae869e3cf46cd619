use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after the given 1-based attempt:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `op` under the policy, retrying failures that satisfy `retryable`.
///
/// Non-retryable failures and exhaustion return the last error. The operation
/// receives the 1-based attempt number.
pub async fn retry_if<T, F, Fut, P>(policy: &RetryPolicy, retryable: P, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_attempts || !retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `retry_if` with the default transport-error predicate.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, Error::is_retryable, op).await
}
