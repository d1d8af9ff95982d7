//! Error types for polystore core.

use crate::audit::ChainDivergence;
use crate::record::Record;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by adapters and the [`crate::Database`] facade.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Byte, blob or cache store error.
    #[error("storage error: {0}")]
    Storage(#[from] polystore_storage::StorageError),

    /// Canonical codec error.
    #[error("codec error: {0}")]
    Codec(#[from] polystore_codec::CodecError),

    /// Transient transport failure talking to a backend.
    #[error("connection to {backend} failed: {message}")]
    Connection {
        /// Backend (provider) name.
        backend: String,
        /// Vendor-supplied description.
        message: String,
        /// Whether the operation may have taken effect before failing.
        maybe_applied: bool,
    },

    /// A backend call did not complete in time.
    #[error("{operation} on {backend} timed out")]
    Timeout {
        /// Backend (provider) name.
        backend: String,
        /// Operation that timed out.
        operation: String,
    },

    /// No pooled connection became available.
    #[error("connection pool for {backend} exhausted after {waited:?}")]
    PoolExhausted {
        /// Backend (provider) name.
        backend: String,
        /// Time spent waiting for a permit.
        waited: Duration,
    },

    /// A unique constraint was violated.
    #[error("conflict in {model}: {message}")]
    Conflict {
        /// Model (or physical table) name.
        model: String,
        /// Field that collided.
        field: String,
        /// Description of the collision.
        message: String,
    },

    /// The query references unknown fields or is malformed.
    #[error("invalid query on {model}: {message}")]
    InvalidQuery {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// No record with the given id is visible to the caller.
    #[error("{model} {id} not found")]
    NotFound {
        /// Model name.
        model: String,
        /// Record id.
        id: String,
    },

    /// An overflow stub could not be resolved to its original value.
    #[error("overflow integrity failure for {store_key}: {message}")]
    OverflowIntegrity {
        /// Blob store key referenced by the stub.
        store_key: String,
        /// What went wrong.
        message: String,
    },

    /// The data mutation committed but its audit entry could not be written.
    #[error("{model} {entity_id} committed but audit append failed: {source}")]
    AuditWrite {
        /// Model name.
        model: String,
        /// Id of the mutated record.
        entity_id: String,
        /// The record as committed.
        record: Box<Record>,
        /// Why the append failed.
        #[source]
        source: Box<CoreError>,
    },

    /// Chain verification found a divergence.
    #[error("audit chain diverges: {0}")]
    ChainDivergence(ChainDivergence),

    /// The model name has no registered schema.
    #[error("model not registered: {name}")]
    ModelNotRegistered {
        /// Requested model name.
        name: String,
    },

    /// A schema failed registration checks.
    #[error("invalid schema for {model}: {message}")]
    InvalidSchema {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// A record failed validation against its schema.
    #[error("validation failed for {model}: {message}")]
    Validation {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// The request context carries no tenant.
    #[error("request context has no tenant id")]
    MissingTenant,

    /// No adapter is configured for a provider.
    #[error("no adapter configured for provider {provider}")]
    ProviderNotConfigured {
        /// Provider name.
        provider: String,
    },

    /// Sealing a field value failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// A sealed field value could not be opened: wrong key, tampered
    /// ciphertext, or a value moved from another record.
    #[error("decryption failed for {model}.{field}: {message}")]
    DecryptionFailed {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
        /// Description of the failure.
        message: String,
    },

    /// Key material has the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// The caller cancelled the operation.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was cancelled.
        operation: String,
    },

    /// The operation is not valid in this state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

/// Where an error happened, for callers deciding how to react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext<'a> {
    /// Model involved.
    pub model: &'a str,
    /// Record id, when the error concerns one record.
    pub id: Option<&'a str>,
}

impl CoreError {
    /// Creates an invalid query error.
    pub fn invalid_query(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            model: model.into(),
            id: id.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(
        model: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            model: model.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    pub fn connection(
        backend: impl Into<String>,
        message: impl Into<String>,
        maybe_applied: bool,
    ) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.into(),
            maybe_applied,
        }
    }

    /// Creates an overflow integrity error.
    pub fn overflow_integrity(store_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OverflowIntegrity {
            store_key: store_key.into(),
            message: message.into(),
        }
    }

    /// Creates an encryption failure.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failure.
    pub fn decryption_failed(
        model: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::DecryptionFailed {
            model: model.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for failure classes worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. } => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the failed operation may have partially applied.
    ///
    /// Only meaningful for transient errors. A non-idempotent operation is
    /// retried only when this is false.
    #[must_use]
    pub fn may_have_applied(&self) -> bool {
        match self {
            Self::Connection { maybe_applied, .. } => *maybe_applied,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Model and id the error concerns, where known.
    #[must_use]
    pub fn context(&self) -> Option<ErrorContext<'_>> {
        match self {
            Self::NotFound { model, id } => Some(ErrorContext {
                model,
                id: Some(id),
            }),
            Self::AuditWrite {
                model, entity_id, ..
            } => Some(ErrorContext {
                model,
                id: Some(entity_id),
            }),
            Self::Conflict { model, .. }
            | Self::InvalidQuery { model, .. }
            | Self::InvalidSchema { model, .. }
            | Self::Validation { model, .. }
            | Self::DecryptionFailed { model, .. } => Some(ErrorContext { model, id: None }),
            Self::ModelNotRegistered { name } => Some(ErrorContext {
                model: name,
                id: None,
            }),
            _ => None,
        }
    }

    /// Rewrites the model name carried by client-level errors.
    ///
    /// Vendor clients only know physical table or collection names.
    #[must_use]
    pub(crate) fn for_model(self, model_name: &str) -> Self {
        match self {
            Self::Conflict { field, message, .. } => Self::Conflict {
                model: model_name.to_string(),
                field,
                message,
            },
            Self::NotFound { id, .. } => Self::NotFound {
                model: model_name.to_string(),
                id,
            },
            other => other,
        }
    }
}
