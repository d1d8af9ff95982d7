//! Database statistics.
//!
//! Counters are atomic and may be read while operations run.
//!
//! ```rust,ignore
//! let snapshot = db.stats();
//! println!("hit ratio: {}/{}", snapshot.cache_hits, snapshot.cache_hits + snapshot.cache_misses);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for one [`crate::Database`].
#[derive(Debug, Default)]
pub struct DatabaseStats {
    reads: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_invalidations: AtomicU64,
    overflow_spills: AtomicU64,
    overflow_restores: AtomicU64,
    audit_appends: AtomicU64,
    audit_failures: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        impl DatabaseStats {
            $(
                pub(crate) fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Returns a point-in-time copy of all counters.
            #[must_use]
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    reads => record_read,
    creates => record_create,
    updates => record_update,
    deletes => record_delete,
    cache_hits => record_cache_hit,
    cache_misses => record_cache_miss,
    cache_invalidations => record_cache_invalidation,
    overflow_spills => record_overflow_spill,
    overflow_restores => record_overflow_restore,
    audit_appends => record_audit_append,
    audit_failures => record_audit_failure,
    retries => record_retry,
    errors => record_error,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Plain copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Read, query and count calls.
    pub reads: u64,
    /// Records created.
    pub creates: u64,
    /// Records updated.
    pub updates: u64,
    /// Records deleted, soft or hard.
    pub deletes: u64,
    /// Reads answered from cache.
    pub cache_hits: u64,
    /// Cache-eligible reads that went to the backend.
    pub cache_misses: u64,
    /// Model-wide cache invalidations.
    pub cache_invalidations: u64,
    /// Fields moved to the blob store.
    pub overflow_spills: u64,
    /// Stubs resolved on read.
    pub overflow_restores: u64,
    /// Audit entries appended.
    pub audit_appends: u64,
    /// Audit appends that failed after commit.
    pub audit_failures: u64,
    /// Backend calls retried.
    pub retries: u64,
    /// Operations that returned an error.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = DatabaseStats::new();
        stats.record_read();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_overflow_spill();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.overflow_spills, 1);
        assert_eq!(snap.audit_appends, 0);
    }

    #[test]
    fn concurrent_updates() {
        let stats = Arc::new(DatabaseStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_create();
                        stats.record_audit_append();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.creates, 2000);
        assert_eq!(snap.audit_appends, 2000);
    }
}
