//! # polystore codec
//!
//! Dynamic values and their canonical CBOR encoding.
//!
//! Every byte-level representation in polystore that must be reproducible
//! goes through this crate: audit entry hashing, query fingerprints, overflow
//! size measurement, cache payloads and the audit log frame format.
//!
//! ## Canonical rules
//!
//! - Integers and lengths use the shortest encoding
//! - Map keys are ordered by encoded bytes (length-first, then bytewise)
//! - No floats, tags or indefinite-length items
//! - Text must be valid UTF-8
//!
//! ```
//! use polystore_codec::{decode_canonical, encode_canonical, Value};
//!
//! let value = Value::text_map([("name", Value::from("Ann")), ("age", Value::from(41i64))]);
//! let bytes = encode_canonical(&value);
//! assert_eq!(decode_canonical(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod json;
mod value;

pub use decoder::{decode_canonical, CanonicalDecoder};
pub use encoder::{encode_canonical, encoded_len, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use value::Value;
