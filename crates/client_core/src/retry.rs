use std::{fmt::Display, future::Future, time::Duration};

use tracing::debug;

pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Bounded retry: one initial attempt plus up to `retries` more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(retries: usize) -> Self {
        Self {
            retries,
            delay: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy is exhausted. The last error is returned unchanged.
pub async fn retry_with<T, E, F, Fut, P>(
    policy: RetryPolicy,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.retries || !should_retry(&err) {
                    return Err(err);
                }
                attempt += 1;
                debug!(
                    attempt,
                    max_retries = policy.retries,
                    error = %err,
                    "retry: attempt failed; retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
