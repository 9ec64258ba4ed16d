//! Bounded retry for operations that can fail transiently.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy: a fixed number of attempts separated by a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Sleep between two attempts
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// Returns the last error when every attempt failed. A policy with zero
/// attempts still runs the operation once.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt, attempts, error = %e, "Attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
