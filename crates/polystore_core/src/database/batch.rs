//! Bulk operation options and results.

use crate::error::CoreError;

/// Default number of items written between cache invalidations.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// How a bulk operation proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Items processed per chunk. The model's cache is invalidated once per
    /// chunk that wrote anything.
    pub chunk_size: usize,
    /// Stop at the first failure instead of attempting every item.
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fail_fast: false,
        }
    }
}

impl BatchOptions {
    /// Default options: chunks of [`DEFAULT_CHUNK_SIZE`], attempt every item.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chunk size (clamped to at least 1).
    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets fail-fast mode.
    #[must_use]
    pub const fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// One failed item of a bulk operation.
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the item in the input.
    pub index: usize,
    /// Why it failed. `AuditWrite` means the item was written.
    pub error: CoreError,
}

/// Outcome of a bulk operation.
#[derive(Debug)]
pub struct BatchResult<T> {
    /// Results of successful items, in input order.
    pub succeeded: Vec<T>,
    /// Failed items, in input order.
    pub failures: Vec<BatchFailure>,
    /// Items never attempted because of fail-fast.
    pub skipped: usize,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
            skipped: 0,
        }
    }
}

impl<T> BatchResult<T> {
    /// Returns true if every item succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}
