//! Bounded retry with linear backoff.
//!
//! Used by the agent poster for HTTP calls and by the PostgreSQL backend for
//! transient driver errors.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Attempt count and delay schedule.
///
/// The delay before retry `n` (1-based) is `base + step * n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(1),
            step: Duration::from_secs(2),
            max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy with the same attempt count and no sleeping, for tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            step: Duration::ZERO,
            max: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        (self.base + self.step * attempt).min(self.max)
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number. `is_transient` decides
    /// whether an error is worth another attempt.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && is_transient(&e) => {
                    let delay = self.delay(attempt);
                    debug!(attempt, ?delay, error = %e, "Transient failure, retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
