//! TTL-aware key-value cache stores.

use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A get/set/delete cache with per-entry time-to-live.
///
/// Implementations may be in-process or front a shared external cache; the
/// contract is the same. Every call is atomic with respect to the others:
/// a reader sees either the whole previous value or the whole new one.
pub trait CacheStore: Send + Sync {
    /// Returns the live value under `key`. Expired entries read as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`. `ttl` of `None` means no expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()>;

    /// Removes `key`. Returns whether a live entry was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    fn clear(&self) -> StorageResult<()>;

    /// Drops expired entries and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    fn purge_expired(&self) -> StorageResult<usize>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process cache store.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl InMemoryCacheStore {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .slots
            .read()
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone()))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.slots
            .write()
            .insert(key.to_string(), Slot { value, expires_at });
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();
        Ok(self
            .slots
            .write()
            .remove(key)
            .is_some_and(|slot| slot.is_live(now)))
    }

    fn clear(&self) -> StorageResult<()> {
        self.slots.write().clear();
        Ok(())
    }

    fn purge_expired(&self) -> StorageResult<usize> {
        let now = Instant::now();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        let purged = before - slots.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired cache entries");
        }
        Ok(purged)
    }
}
