//! Bounded retries with fixed or linear backoff.
//!
//! Readiness probing uses linear backoff (attempt N sleeps N steps), upgrade
//! polling uses a fixed interval. Command execution is never retried here:
//! only the readiness boundary retries connectivity failures.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let out = retry_with_backoff(
//!     &RetryConfig::linear(6, Duration::from_secs(1)),
//!     "ping 10.0.0.1",
//!     || async { executor.ping(host).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How the delay grows between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed,
    /// `step * attempt`
    Linear,
}

/// Bounded retry policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts including the first, at least one.
    pub max_attempts: u32,
    /// Base delay.
    pub step: Duration,
    /// Growth strategy.
    pub backoff: Backoff,
}

impl RetryConfig {
    /// Linear backoff: attempt N waits `step * N`.
    pub fn linear(attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            step,
            backoff: Backoff::Linear,
        }
    }

    /// Fixed interval between attempts.
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            step: interval,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.step,
            Backoff::Linear => self.step.saturating_mul(attempt),
        }
    }
}

/// Run `operation` until it succeeds or the attempts run out.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if attempt >= config.max_attempts {
            warn!(operation = %operation_name, attempt, error = %err, "giving up");
            return Err(err);
        }
        let delay = config.delay_after(attempt);
        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "not yet, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
