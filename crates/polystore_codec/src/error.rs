//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while decoding canonical CBOR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of an item.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Bytes remained after the top-level item.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// Float values are not part of the value model.
    #[error("float values are forbidden in canonical CBOR")]
    FloatForbidden,

    /// Indefinite-length items are forbidden.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLengthForbidden,

    /// Invalid UTF-8 in a text string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Integer does not fit into `i64`.
    #[error("integer overflow")]
    IntegerOverflow,

    /// A declared length exceeds the decoder limits.
    #[error("declared length {claimed} exceeds limit {limit}")]
    LengthLimitExceeded {
        /// Length claimed by the input.
        claimed: u64,
        /// Maximum accepted length.
        limit: u64,
    },

    /// The input is structurally valid CBOR but not canonical.
    #[error("non-canonical encoding: {message}")]
    NonCanonical {
        /// What rule was violated.
        message: String,
    },

    /// The input is not valid CBOR for this value model.
    #[error("invalid CBOR structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// A JSON value could not be represented.
    #[error("unsupported JSON value: {message}")]
    UnsupportedJson {
        /// Description of the offending value.
        message: String,
    },
}

impl CodecError {
    /// Creates a non-canonical encoding error.
    pub fn non_canonical(message: impl Into<String>) -> Self {
        Self::NonCanonical {
            message: message.into(),
        }
    }

    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Creates an unsupported JSON error.
    pub fn unsupported_json(message: impl Into<String>) -> Self {
        Self::UnsupportedJson {
            message: message.into(),
        }
    }
}
