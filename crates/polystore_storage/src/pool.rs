//! Bounded in-flight operation permits.
//!
//! A [`PermitPool`] stands in front of a vendor client and caps how many
//! operations may be outstanding against it at once. Callers block only
//! while the pool is exhausted, and never longer than the configured
//! acquire timeout.

use crate::error::{StorageError, StorageResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Pool sizing for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections the vendor client should keep warm.
    pub min: usize,
    /// Maximum concurrent in-flight operations.
    pub max: usize,
    /// How long `acquire` waits before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Creates a config with the given bounds and the default timeout.
    #[must_use]
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            ..Self::default()
        }
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Counting semaphore with timeout, handing out RAII permits.
#[derive(Debug)]
pub struct PermitPool {
    config: PoolConfig,
    in_flight: Mutex<usize>,
    released: Condvar,
}

impl PermitPool {
    /// Creates a pool. `max` is clamped to at least 1 and `min` to `max`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let max = config.max.max(1);
        let config = PoolConfig {
            min: config.min.min(max),
            max,
            acquire_timeout: config.acquire_timeout,
        };
        Self {
            config,
            in_flight: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes a permit, waiting up to the acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PoolExhausted`] if no permit frees up in time.
    pub fn acquire(&self) -> StorageResult<PoolPermit<'_>> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= self.config.max {
            if self.released.wait_until(&mut in_flight, deadline).timed_out()
                && *in_flight >= self.config.max
            {
                let waited = started.elapsed();
                tracing::warn!(max = self.config.max, ?waited, "permit pool exhausted");
                return Err(StorageError::PoolExhausted {
                    max: self.config.max,
                    waited,
                });
            }
        }
        *in_flight += 1;
        Ok(PoolPermit { pool: self })
    }

    /// Operations currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Permits that could be taken without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.config.max - self.in_flight()
    }

    fn release(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        drop(in_flight);
        self.released.notify_one();
    }
}

/// A held permit; released on drop.
#[derive(Debug)]
pub struct PoolPermit<'a> {
    pool: &'a PermitPool,
}

impl Drop for PoolPermit<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permits_are_returned_on_drop() {
        let pool = PermitPool::new(PoolConfig::new(0, 2));
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = PermitPool::new(PoolConfig::new(1, 1).acquire_timeout(Duration::from_millis(20)));
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, StorageError::PoolExhausted { max: 1, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn waiter_wakes_when_permit_released() {
        let pool = Arc::new(PermitPool::new(
            PoolConfig::new(1, 1).acquire_timeout(Duration::from_secs(5)),
        ));
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|_permit| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn zero_max_is_clamped() {
        let pool = PermitPool::new(PoolConfig::new(5, 0));
        assert_eq!(pool.config().max, 1);
        assert_eq!(pool.config().min, 1);
    }
}
