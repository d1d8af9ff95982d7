//! Persistence contract for audit chains.

use super::entry::AuditEntry;
use crate::error::CoreResult;
use parking_lot::{Mutex, RwLock};
use polystore_storage::StorageError;
use std::collections::BTreeMap;

/// Append-only storage of audit entries, partitioned by tenant.
///
/// Stores persist what they are given; ordering and hashing are the
/// chain's job. Entries of one tenant are returned in append order.
pub trait AuditStore: Send + Sync {
    /// Appends an entry to its tenant's log. Must be durable on return.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    fn append(&self, entry: &AuditEntry) -> CoreResult<()>;

    /// Most recently appended entry for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn last(&self, tenant: &str) -> CoreResult<Option<AuditEntry>>;

    /// Entries for `tenant` with `from <= sequence_no < to`, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn range(&self, tenant: &str, from: u64, to: u64) -> CoreResult<Vec<AuditEntry>>;

    /// Tenants with at least one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn tenants(&self) -> CoreResult<Vec<String>>;
}

/// Audit store held in memory, with fault injection and tampering hooks
/// for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: RwLock<BTreeMap<String, Vec<AuditEntry>>>,
    failures: Mutex<usize>,
}

impl MemoryAuditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` appends fail.
    pub fn fail_next(&self, n: usize) {
        *self.failures.lock() = n;
    }

    /// Total entries across tenants.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    /// Returns true if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the stored entry at `position` in `tenant`'s log.
    /// Returns false if there is no such entry.
    pub fn tamper<F>(&self, tenant: &str, position: usize, f: F) -> bool
    where
        F: FnOnce(&mut AuditEntry),
    {
        match self
            .entries
            .write()
            .get_mut(tenant)
            .and_then(|log| log.get_mut(position))
        {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Removes the stored entry at `position` in `tenant`'s log.
    pub fn remove(&self, tenant: &str, position: usize) -> Option<AuditEntry> {
        let mut entries = self.entries.write();
        let log = entries.get_mut(tenant)?;
        (position < log.len()).then(|| log.remove(position))
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> CoreResult<()> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StorageError::Unavailable("injected audit store failure".into()).into());
            }
        }
        self.entries
            .write()
            .entry(entry.tenant_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn last(&self, tenant: &str) -> CoreResult<Option<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .get(tenant)
            .and_then(|log| log.last().cloned()))
    }

    fn range(&self, tenant: &str, from: u64, to: u64) -> CoreResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .get(tenant)
            .map(|log| {
                log.iter()
                    .filter(|e| (from..to).contains(&e.sequence_no))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn tenants(&self) -> CoreResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{sample_event, GENESIS_HASH};
    use crate::error::CoreError;

    #[test]
    fn append_last_and_range() {
        let store = MemoryAuditStore::new();
        let a = AuditEntry::seal(sample_event("t1", "u1"), 0, 10, GENESIS_HASH);
        let b = AuditEntry::seal(sample_event("t1", "u2"), 1, 20, a.this_hash);
        let c = AuditEntry::seal(sample_event("t2", "u3"), 0, 30, GENESIS_HASH);
        for e in [&a, &b, &c] {
            store.append(e).unwrap();
        }
        assert_eq!(store.last("t1").unwrap(), Some(b.clone()));
        assert_eq!(store.range("t1", 1, u64::MAX).unwrap(), vec![b]);
        assert_eq!(store.tenants().unwrap(), vec!["t1", "t2"]);
        assert_eq!(store.last("t9").unwrap(), None);
    }

    #[test]
    fn injected_failure_stores_nothing() {
        let store = MemoryAuditStore::new();
        store.fail_next(1);
        let entry = AuditEntry::seal(sample_event("t1", "u1"), 0, 10, GENESIS_HASH);
        assert!(matches!(store.append(&entry), Err(CoreError::Storage(_))));
        assert!(store.is_empty());
        store.append(&entry).unwrap();
        assert_eq!(store.len(), 1);
    }
}
