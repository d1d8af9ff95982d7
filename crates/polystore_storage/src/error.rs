//! Error types for storage operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in byte, blob and cache stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Stored data failed a structural check.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A key is not acceptable to the store.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// No permit became available before the acquire timeout.
    #[error("pool exhausted: {max} permits in flight, waited {waited:?}")]
    PoolExhausted {
        /// Pool capacity.
        max: usize,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The store is unreachable. Raised by fault-injecting test doubles and
    /// by adapters wrapping remote stores.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Returns true for failures worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::PoolExhausted { .. } | StorageError::Unavailable(_)
        )
    }
}
