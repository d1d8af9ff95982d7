//! Concurrent load helpers.
//!
//! Each helper drives a shared [`Database`] from several threads and
//! reports what succeeded. Assertions are left to the caller.

use polystore_core::{Database, Record, RequestContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Total operations attempted.
    pub total_ops: usize,
    /// Operations that returned `Ok`.
    pub successful_ops: usize,
    /// Operations that returned `Err`.
    pub failed_ops: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

impl StressResult {
    fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            duration,
        }
    }

    /// Operations per second, or 0 for an instantaneous run.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Creates `per_thread` records from each of `threads` threads, all under
/// `ctx`. `make` receives the thread index and the per-thread sequence.
pub fn concurrent_creates<F>(
    db: &Database,
    ctx: &RequestContext,
    model: &str,
    threads: usize,
    per_thread: usize,
    make: F,
) -> StressResult
where
    F: Fn(usize, usize) -> Record + Sync,
{
    let ok = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let (ok, failed, make) = (&ok, &failed, &make);
            scope.spawn(move || {
                for i in 0..per_thread {
                    match db.create(ctx, model, make(t, i)) {
                        Ok(_) => ok.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressResult::new(
        ok.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Applies `rounds` updates to the record `id` from each of `threads`
/// threads. `make` receives the thread index and the round.
pub fn concurrent_updates<F>(
    db: &Database,
    ctx: &RequestContext,
    model: &str,
    id: &str,
    threads: usize,
    rounds: usize,
    make: F,
) -> StressResult
where
    F: Fn(usize, usize) -> Record + Sync,
{
    let ok = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let (ok, failed, make) = (&ok, &failed, &make);
            scope.spawn(move || {
                for round in 0..rounds {
                    match db.update(ctx, model, id, make(t, round)) {
                        Ok(_) => ok.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressResult::new(
        ok.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}
