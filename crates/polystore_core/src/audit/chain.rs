//! Per-tenant hash chain over an [`AuditStore`].
//!
//! Sequence assignment and `prev_hash` selection happen under a lock
//! scoped to the tenant, so concurrent writers can never fork a chain.
//! Different tenants append in parallel.

use super::entry::{AuditEntry, AuditEvent, EntryHash, GENESIS_HASH};
use super::store::AuditStore;
use crate::clock::Clock;
use crate::error::CoreResult;
use crate::stats::DatabaseStats;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How a chain diverges at a given entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    /// The entry's sequence number is not the next one.
    SequenceGap {
        /// Sequence number that should have been found.
        expected: u64,
    },
    /// `prev_hash` does not equal the preceding entry's `this_hash`.
    PrevHashMismatch,
    /// `this_hash` does not recompute from the stored fields.
    HashMismatch,
    /// The entry belongs to another tenant.
    TenantMismatch,
}

/// First point at which a tenant's chain fails verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDivergence {
    /// Tenant whose chain was walked.
    pub tenant_id: String,
    /// Sequence number stored on the offending entry.
    pub sequence_no: u64,
    /// What went wrong.
    pub kind: DivergenceKind,
}

impl fmt::Display for ChainDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tenant {} at sequence {}: ", self.tenant_id, self.sequence_no)?;
        match self.kind {
            DivergenceKind::SequenceGap { expected } => write!(f, "expected sequence {expected}"),
            DivergenceKind::PrevHashMismatch => write!(f, "prev_hash does not link to predecessor"),
            DivergenceKind::HashMismatch => write!(f, "this_hash does not match content"),
            DivergenceKind::TenantMismatch => write!(f, "entry belongs to another tenant"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tail {
    next_sequence: u64,
    hash: EntryHash,
}

/// `None` until loaded from the store; reset to `None` after a failed append.
type TailSlot = Arc<Mutex<Option<Tail>>>;

/// Appends and verifies tenant audit chains.
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    tails: Mutex<HashMap<String, TailSlot>>,
    stats: Option<Arc<DatabaseStats>>,
}

impl fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditChain")
            .field("tenants", &self.tails.lock().len())
            .finish_non_exhaustive()
    }
}

impl AuditChain {
    /// Creates a chain writer over `store`, stamping entries from `clock`.
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            tails: Mutex::new(HashMap::new()),
            stats: None,
        }
    }

    pub(crate) fn with_stats(mut self, stats: Arc<DatabaseStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn slot(&self, tenant: &str) -> TailSlot {
        Arc::clone(
            self.tails
                .lock()
                .entry(tenant.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    /// Seals `event` as the tenant's next entry and persists it.
    ///
    /// # Errors
    ///
    /// Returns the store's error. The tail is reloaded from the store on
    /// the next append, so a failure never leaves a gap.
    pub fn append(&self, event: AuditEvent) -> CoreResult<AuditEntry> {
        let slot = self.slot(&event.tenant_id);
        let mut tail = slot.lock();

        let result = self.append_locked(&mut tail, event);
        match &result {
            Ok(entry) => {
                tracing::trace!(
                    tenant = %entry.tenant_id,
                    sequence = entry.sequence_no,
                    action = %entry.action,
                    "audit entry appended"
                );
                if let Some(stats) = &self.stats {
                    stats.record_audit_append();
                }
            }
            Err(err) => {
                *tail = None;
                tracing::warn!(error = %err, "audit append failed");
                if let Some(stats) = &self.stats {
                    stats.record_audit_failure();
                }
            }
        }
        result
    }

    fn append_locked(&self, tail: &mut Option<Tail>, event: AuditEvent) -> CoreResult<AuditEntry> {
        let current = match *tail {
            Some(t) => t,
            None => match self.store.last(&event.tenant_id)? {
                Some(last) => Tail {
                    next_sequence: last.sequence_no + 1,
                    hash: last.this_hash,
                },
                None => Tail {
                    next_sequence: 0,
                    hash: GENESIS_HASH,
                },
            },
        };
        let timestamp = self.clock.now().timestamp_micros();
        let entry = AuditEntry::seal(event, current.next_sequence, timestamp, current.hash);
        self.store.append(&entry)?;
        *tail = Some(Tail {
            next_sequence: entry.sequence_no + 1,
            hash: entry.this_hash,
        });
        Ok(entry)
    }

    /// Walks the tenant's chain from genesis and returns the first divergence.
    ///
    /// # Errors
    ///
    /// Returns the store's error if entries cannot be read.
    pub fn verify_chain(&self, tenant: &str) -> CoreResult<Option<ChainDivergence>> {
        let mut entries = self.store.range(tenant, 0, u64::MAX)?;
        entries.sort_by_key(|e| e.sequence_no);

        let divergence = |entry: &AuditEntry, kind| ChainDivergence {
            tenant_id: tenant.to_string(),
            sequence_no: entry.sequence_no,
            kind,
        };
        let mut expected = 0;
        let mut prev = GENESIS_HASH;
        for entry in &entries {
            let kind = if entry.tenant_id != tenant {
                Some(DivergenceKind::TenantMismatch)
            } else if entry.sequence_no != expected {
                Some(DivergenceKind::SequenceGap { expected })
            } else if entry.prev_hash != prev {
                Some(DivergenceKind::PrevHashMismatch)
            } else if !entry.is_self_consistent() {
                Some(DivergenceKind::HashMismatch)
            } else {
                None
            };
            if let Some(kind) = kind {
                let found = divergence(entry, kind);
                tracing::warn!(divergence = %found, "audit chain verification failed");
                return Ok(Some(found));
            }
            expected += 1;
            prev = entry.this_hash;
        }
        tracing::debug!(tenant, entries = entries.len(), "audit chain verified");
        Ok(None)
    }

    /// Entries with `from <= sequence_no < to`.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn entries(&self, tenant: &str, from: u64, to: u64) -> CoreResult<Vec<AuditEntry>> {
        self.store.range(tenant, from, to)
    }

    /// Tenants with at least one entry.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn tenants(&self) -> CoreResult<Vec<String>> {
        self.store.tenants()
    }
}
