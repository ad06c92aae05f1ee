//! Bounded exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// How often and how patiently to retry a backend call.
///
/// The delay starts at `base_delay` and doubles after every failed attempt,
/// capped at `max_delay`. Only errors for which
/// [`StorageError::is_transient`] holds are retried; once the attempts are
/// used up the last error is surfaced as [`StorageError::BackendUnavailable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY.max(base_delay),
        }
    }

    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Total attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, backend: &'static str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= attempts => {
                    warn!(backend, attempts, error = %err, "backend still failing, giving up");
                    return Err(StorageError::BackendUnavailable {
                        backend,
                        attempts,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    debug!(backend, attempt, delay = ?delay, error = %err, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
