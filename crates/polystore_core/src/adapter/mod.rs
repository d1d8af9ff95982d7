//! Backend adapters: one uniform contract per storage family.
//!
//! An adapter owns a vendor client and a [`PermitPool`]. It translates,
//! executes and maps results, and never retries; retry policy lives in
//! the orchestrator, which knows whether an operation is idempotent.

mod document;
mod memory_document;
mod memory_sql;
mod relational;

pub use document::{DocumentAdapter, DocumentClient, ReplaceOutcome, StoredDocument};
pub use memory_document::{MemoryDocumentClient, ScanCounts};
pub use memory_sql::MemorySqlClient;
pub use relational::{RelationalAdapter, SqlClient, SqlOutcome};

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::query::QuerySpec;
use crate::record::{FieldChanges, Record};
use crate::schema::{ModelSchema, StorageFamily};
use crate::translate::QueryWarning;
use polystore_codec::Value;
use polystore_storage::{PermitPool, PoolPermit, StorageError};

/// Rows returned by a read, plus advisories.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOutput {
    /// Matching records, shaped per the spec.
    pub records: Vec<Record>,
    /// Advisories such as emulated pagination.
    pub warnings: Vec<QueryWarning>,
}

/// The stored record after an update, with what actually changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Record as stored.
    pub record: Record,
    /// Fields whose stored value differs from before.
    pub changes: FieldChanges,
}

/// Attempts an adapter makes to land an update before giving up with
/// `Conflict`. Each retry follows a concurrent write to the same record.
pub const MAX_WRITE_RACES: usize = 64;

/// Physical address of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    /// Partition key value.
    pub partition: Value,
    /// Row key value.
    pub row: Value,
}

/// Identifies one stored record.
///
/// Relational backends address rows by id; document backends need the
/// partition and row key as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    /// Record id.
    pub id: String,
    /// Document address, for document models.
    pub document: Option<DocumentKey>,
}

impl RecordKey {
    /// Key for a relational row.
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: None,
        }
    }

    /// Derives the key of a stored record.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the record has no id.
    pub fn of(schema: &ModelSchema, record: &Record) -> CoreResult<Self> {
        let id = record
            .id()
            .ok_or_else(|| CoreError::validation(&schema.name, "record has no id"))?;
        let document = (schema.family == StorageFamily::Document).then(|| DocumentKey {
            partition: record.get_or_null(&schema.partition_key).clone(),
            row: record.get_or_null(&schema.row_key).clone(),
        });
        Ok(Self {
            id: id.to_string(),
            document,
        })
    }
}

/// The capability contract every backend implements.
///
/// Object safe, so the orchestrator can hold `Arc<dyn BackendAdapter>`.
pub trait BackendAdapter: Send + Sync {
    /// Provider name, used in errors and logs.
    fn name(&self) -> &str;

    /// Storage family served.
    fn family(&self) -> StorageFamily;

    /// Inserts a fully populated record and returns it as stored.
    ///
    /// # Errors
    ///
    /// `Conflict` on a unique collision, `Connection`/`PoolExhausted` on
    /// transport failure.
    fn create(&self, schema: &ModelSchema, record: &Record) -> CoreResult<Record>;

    /// Runs a query.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for unknown fields, `Cancelled` if the token fires.
    fn read(&self, schema: &ModelSchema, spec: &QuerySpec, cancel: &CancelToken)
        -> CoreResult<QueryOutput>;

    /// Writes the fields of `patch` that differ from the stored record.
    ///
    /// The write is conditional on the record still holding the values it
    /// was diffed against, so concurrent updates never lose each other's
    /// fields and every reported `old` value is the one replaced. Each
    /// field of `guard` must hold its given value (null matches null) both
    /// when the record is read and when it is written; a record failing
    /// the guard is treated as absent.
    ///
    /// # Errors
    ///
    /// `NotFound` if no record has this key or the guard fails,
    /// `Conflict` if the record keeps changing for [`MAX_WRITE_RACES`]
    /// attempts.
    fn update(
        &self,
        schema: &ModelSchema,
        key: &RecordKey,
        patch: &Record,
        guard: &Record,
    ) -> CoreResult<UpdateOutcome>;

    /// Removes a record. Only hard deletes exist at this level.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when `hard` is false, `NotFound` if absent.
    fn delete(&self, schema: &ModelSchema, key: &RecordKey, hard: bool) -> CoreResult<()>;

    /// Counts matching rows (or groups, for grouped specs).
    ///
    /// # Errors
    ///
    /// As for [`BackendAdapter::read`].
    fn count(&self, schema: &ModelSchema, spec: &QuerySpec, cancel: &CancelToken) -> CoreResult<u64>;
}

/// Acquires a pool permit, naming the provider on exhaustion.
pub(crate) fn acquire<'a>(pool: &'a PermitPool, backend: &str) -> CoreResult<PoolPermit<'a>> {
    pool.acquire().map_err(|err| match err {
        StorageError::PoolExhausted { waited, .. } => CoreError::PoolExhausted {
            backend: backend.to_string(),
            waited,
        },
        other => CoreError::Storage(other),
    })
}

/// True when every guard field holds its value in `record`.
pub(crate) fn satisfies(record: &Record, guard: &Record) -> bool {
    guard.iter().all(|(name, value)| record.get_or_null(name) == value)
}

pub(crate) fn write_race(schema: &ModelSchema, id: &str) -> CoreError {
    CoreError::conflict(
        &schema.name,
        crate::record::field::ID,
        format!("record {id} changed {MAX_WRITE_RACES} times during one update"),
    )
}

pub(crate) fn reject_soft_delete(hard: bool) -> CoreResult<()> {
    if hard {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(
            "adapters only hard delete; soft delete is an update",
        ))
    }
}
