//! Tamper-evident audit trail.
//!
//! Every committed mutation appends one [`AuditEntry`] to its tenant's
//! chain. Each entry hashes its predecessor:
//!
//! ```text
//! this_hash = SHA-256(prev_hash ‖ canonical(body))
//! ```
//!
//! so editing, removing or reordering any entry breaks every later link.
//! [`AuditChain::verify_chain`] walks a chain from genesis and reports the
//! first entry that does not check out.
//!
//! Storage is pluggable through [`AuditStore`]. [`MemoryAuditStore`] keeps
//! entries in memory; [`LogAuditStore`] writes length-prefixed frames to a
//! byte backend and survives restarts.

mod chain;
mod entry;
mod log;
mod store;

pub use chain::{AuditChain, ChainDivergence, DivergenceKind};
pub use entry::{AuditAction, AuditEntry, AuditEvent, EntryHash, GENESIS_HASH};
pub use log::LogAuditStore;
pub use store::{AuditStore, MemoryAuditStore};
