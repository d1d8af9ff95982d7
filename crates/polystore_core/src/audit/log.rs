//! Audit store over an append-only byte backend.
//!
//! Frame format: `len: u32 LE` followed by `len` bytes of the entry's
//! canonical CBOR. The per-tenant index is rebuilt by scanning on open;
//! a torn trailing frame (crash mid-append) is truncated away.

use super::entry::AuditEntry;
use super::store::AuditStore;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use polystore_codec::{decode_canonical, encode_canonical};
use polystore_storage::{StorageBackend, StorageError};
use std::collections::BTreeMap;

const LEN_SIZE: u64 = 4;

struct LogState<B> {
    backend: B,
    /// Frame offsets per tenant, in append order.
    index: BTreeMap<String, Vec<u64>>,
    /// Last entry per tenant.
    tails: BTreeMap<String, AuditEntry>,
}

/// Durable [`AuditStore`] writing length-prefixed frames to a
/// [`StorageBackend`].
pub struct LogAuditStore<B> {
    state: Mutex<LogState<B>>,
    sync_on_append: bool,
}

impl<B> std::fmt::Debug for LogAuditStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAuditStore")
            .field("sync_on_append", &self.sync_on_append)
            .finish_non_exhaustive()
    }
}

fn read_frame<B: StorageBackend>(backend: &B, offset: u64) -> CoreResult<AuditEntry> {
    let header = backend.read_at(offset, LEN_SIZE as usize)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let payload = backend.read_at(offset + LEN_SIZE, len as usize)?;
    let value = decode_canonical(&payload)?;
    Ok(AuditEntry::from_value(&value)?)
}

impl<B: StorageBackend> LogAuditStore<B> {
    /// Opens the log, rebuilding the index from existing frames.
    ///
    /// # Errors
    ///
    /// Returns `Storage(Corrupted)` if a complete frame does not decode.
    pub fn open(mut backend: B) -> CoreResult<Self> {
        let size = backend.size()?;
        let mut index: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut tails = BTreeMap::new();
        let mut offset = 0;

        while offset < size {
            if offset + LEN_SIZE > size {
                break;
            }
            let header = backend.read_at(offset, LEN_SIZE as usize)?;
            let len = u64::from(u32::from_le_bytes([header[0], header[1], header[2], header[3]]));
            if offset + LEN_SIZE + len > size {
                break;
            }
            let entry = read_frame(&backend, offset).map_err(|err| {
                CoreError::Storage(StorageError::Corrupted(format!(
                    "audit frame at offset {offset}: {err}"
                )))
            })?;
            index.entry(entry.tenant_id.clone()).or_default().push(offset);
            tails.insert(entry.tenant_id.clone(), entry);
            offset += LEN_SIZE + len;
        }

        if offset < size {
            tracing::warn!(offset, size, "truncating torn audit frame");
            backend.truncate(offset)?;
            backend.sync()?;
        }
        tracing::debug!(
            tenants = index.len(),
            frames = index.values().map(Vec::len).sum::<usize>(),
            "audit log opened"
        );

        Ok(Self {
            state: Mutex::new(LogState {
                backend,
                index,
                tails,
            }),
            sync_on_append: true,
        })
    }

    /// Whether every append is synced before returning. Defaults to true.
    #[must_use]
    pub fn sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Size of the underlying log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.state.lock().backend.size()?)
    }

    /// Releases the backend.
    pub fn into_backend(self) -> B {
        self.state.into_inner().backend
    }
}

impl<B: StorageBackend> AuditStore for LogAuditStore<B> {
    fn append(&self, entry: &AuditEntry) -> CoreResult<()> {
        let payload = encode_canonical(&entry.to_value());
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("audit entry exceeds 4 GiB"))?;
        let mut frame = Vec::with_capacity(LEN_SIZE as usize + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut state = self.state.lock();
        let offset = state.backend.append(&frame)?;
        if self.sync_on_append {
            state.backend.sync()?;
        } else {
            state.backend.flush()?;
        }
        state
            .index
            .entry(entry.tenant_id.clone())
            .or_default()
            .push(offset);
        state.tails.insert(entry.tenant_id.clone(), entry.clone());
        Ok(())
    }

    fn last(&self, tenant: &str) -> CoreResult<Option<AuditEntry>> {
        Ok(self.state.lock().tails.get(tenant).cloned())
    }

    fn range(&self, tenant: &str, from: u64, to: u64) -> CoreResult<Vec<AuditEntry>> {
        let state = self.state.lock();
        let Some(offsets) = state.index.get(tenant) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for &offset in offsets {
            let entry = read_frame(&state.backend, offset)?;
            if (from..to).contains(&entry.sequence_no) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn tenants(&self) -> CoreResult<Vec<String>> {
        Ok(self.state.lock().index.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{sample_event, GENESIS_HASH};
    use polystore_storage::{FileBackend, InMemoryBackend};
    use tempfile::tempdir;

    fn chain_of(tenant: &str, n: u64) -> Vec<AuditEntry> {
        let mut prev = GENESIS_HASH;
        (0..n)
            .map(|i| {
                let e = AuditEntry::seal(sample_event(tenant, &format!("e{i}")), i, 100 + i as i64, prev);
                prev = e.this_hash;
                e
            })
            .collect()
    }

    #[test]
    fn reopen_rebuilds_index() {
        let store = LogAuditStore::open(InMemoryBackend::new()).unwrap();
        for e in chain_of("t1", 3).iter().chain(chain_of("t2", 2).iter()) {
            store.append(e).unwrap();
        }
        let reopened = LogAuditStore::open(store.into_backend()).unwrap();
        assert_eq!(reopened.tenants().unwrap(), vec!["t1", "t2"]);
        assert_eq!(reopened.range("t1", 0, u64::MAX).unwrap(), chain_of("t1", 3));
        assert_eq!(reopened.last("t2").unwrap().map(|e| e.sequence_no), Some(1));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let store = LogAuditStore::open(InMemoryBackend::new()).unwrap();
        for e in chain_of("t1", 2) {
            store.append(&e).unwrap();
        }
        let good_size = store.size().unwrap();
        let mut data = store.into_backend().data();
        data.extend_from_slice(&[200, 0, 0, 0, 0xa1]);

        let reopened = LogAuditStore::open(InMemoryBackend::with_data(data)).unwrap();
        assert_eq!(reopened.size().unwrap(), good_size);
        assert_eq!(reopened.range("t1", 0, u64::MAX).unwrap().len(), 2);
        let next = AuditEntry::seal(sample_event("t1", "e2"), 2, 300, GENESIS_HASH);
        reopened.append(&next).unwrap();
        assert_eq!(reopened.last("t1").unwrap(), Some(next));
    }

    #[test]
    fn complete_but_garbled_frame_is_corruption() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0xff, 0xff]);
        assert!(matches!(
            LogAuditStore::open(InMemoryBackend::with_data(data)),
            Err(CoreError::Storage(StorageError::Corrupted(_)))
        ));
    }

    #[test]
    fn file_backed_log_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("chain.log");
        {
            let store = LogAuditStore::open(FileBackend::open(&path).unwrap()).unwrap();
            for e in chain_of("t1", 4) {
                store.append(&e).unwrap();
            }
        }
        let store = LogAuditStore::open(FileBackend::open(&path).unwrap()).unwrap();
        assert_eq!(store.range("t1", 1, 3).unwrap(), chain_of("t1", 4)[1..3].to_vec());
    }
}
