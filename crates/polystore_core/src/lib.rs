//! # polystore core
//!
//! Multi-backend data access for multi-tenant services.
//!
//! This crate provides:
//! - A schema registry and backend-neutral query specifications
//! - Query translation to parameterized SQL and to key-scoped document scans
//! - Relational and document adapters behind one [`BackendAdapter`] contract
//! - Overflow of oversized fields to a blob store, restored on read
//! - AES-256-GCM encryption of declared fields, keyed per tenant
//! - A generation-invalidated result cache
//! - A per-tenant, hash-chained audit trail with verification
//! - Retry with backoff for transient failures, and read cancellation
//!
//! [`Database`] is the entry point: it injects tenant and lifecycle fields,
//! hides soft-deleted records, pages by keyset tokens, upserts by id and
//! audits every committed write.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod audit;
pub mod cache;
mod cancel;
mod clock;
mod config;
mod context;
pub mod crypto;
mod database;
mod error;
pub mod overflow;
pub mod query;
mod record;
mod retry;
pub mod schema;
mod stats;
pub mod translate;

pub use adapter::{
    BackendAdapter, DocumentAdapter, DocumentClient, DocumentKey, MemoryDocumentClient,
    MemorySqlClient, QueryOutput, RecordKey, RelationalAdapter, ReplaceOutcome, SqlClient,
    SqlOutcome, StoredDocument, UpdateOutcome,
};
pub use audit::{
    AuditAction, AuditChain, AuditEntry, AuditStore, ChainDivergence, DivergenceKind,
    LogAuditStore, MemoryAuditStore,
};
pub use cache::CacheLayer;
pub use cancel::CancelToken;
pub use clock::{record_timestamp, Clock, FixedClock, SystemClock};
pub use config::{Config, DEFAULT_OVERFLOW_THRESHOLD};
pub use context::RequestContext;
pub use crypto::{EncryptionKey, FieldEncryption};
pub use database::{
    BatchFailure, BatchOptions, BatchResult, Database, DatabaseBuilder, Page, ReadOptions,
    DEFAULT_CHUNK_SIZE,
};
pub use error::{CoreError, CoreResult, ErrorContext};
pub use overflow::{OverflowManager, OverflowStub};
pub use query::{Direction, Distinct, Operator, OrderBy, Predicate, QuerySpec};
pub use record::{field, FieldChange, FieldChanges, Record};
pub use retry::{Idempotency, RetryConfig, RetryPolicy};
pub use schema::{CachePolicy, FieldDef, FieldKind, ModelSchema, SchemaRegistry, StorageFamily};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use translate::QueryWarning;

pub use polystore_codec::Value;
pub use polystore_storage::PoolConfig;
