//! # polystore storage
//!
//! Contracts for the collaborators polystore talks to but does not own,
//! together with reference implementations used in tests and single-process
//! deployments.
//!
//! - [`StorageBackend`]: append-only byte store for the audit log
//!   ([`InMemoryBackend`], [`FileBackend`])
//! - [`BlobStore`]: key-value payload store for overflowed fields
//!   ([`InMemoryBlobStore`], [`DirectoryBlobStore`])
//! - [`CacheStore`]: TTL-respecting cache ([`InMemoryCacheStore`])
//! - [`PermitPool`]: bound on in-flight operations per backend
//!
//! ```rust
//! use polystore_storage::{BlobStore, InMemoryBlobStore};
//!
//! let blobs = InMemoryBlobStore::new();
//! blobs.put("overflow/abc", b"payload").unwrap();
//! assert_eq!(blobs.get("overflow/abc").unwrap(), Some(b"payload".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod blob;
mod cache;
mod error;
mod file;
mod memory;
mod pool;

pub use backend::StorageBackend;
pub use blob::{BlobStore, DirectoryBlobStore, InMemoryBlobStore};
pub use cache::{CacheStore, InMemoryCacheStore};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use pool::{PermitPool, PoolConfig, PoolPermit};
