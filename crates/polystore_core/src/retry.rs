//! Retry with exponential backoff for transient backend failures.

use crate::error::CoreResult;
use crate::stats::DatabaseStats;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with `max_attempts` and default delays.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, never retried.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1-based). Zero for `retry == 0`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let secs = if self.add_jitter && capped > 0.0 {
            capped + capped * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            capped
        };
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Whether repeating an operation is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Safe to repeat (reads, counts).
    Idempotent,
    /// Repeat only if the failed attempt certainly did not apply.
    NonIdempotent,
}

/// Applies a [`RetryConfig`] around backend calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    stats: Option<Arc<DatabaseStats>>,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: None,
        }
    }

    pub(crate) fn with_stats(mut self, stats: Arc<DatabaseStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// The underlying configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `f`, retrying transient failures.
    ///
    /// A failure is retried when it is transient and either the operation is
    /// idempotent or the error guarantees nothing was applied. The closure
    /// receives the 0-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-retryable error.
    pub fn run<T, F>(&self, operation: &str, idempotency: Idempotency, mut f: F) -> CoreResult<T>
    where
        F: FnMut(u32) -> CoreResult<T>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_transient()
                        && (idempotency == Idempotency::Idempotent || !err.may_have_applied());
                    if !retryable || attempt + 1 >= max_attempts {
                        if retryable {
                            tracing::warn!(op = operation, attempts = attempt + 1, error = %err, "retries exhausted");
                        }
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.config.delay_for_retry(attempt);
                    tracing::debug!(op = operation, attempt, ?delay, error = %err, "retrying after transient failure");
                    if let Some(stats) = &self.stats {
                        stats.record_retry();
                    }
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }
}
