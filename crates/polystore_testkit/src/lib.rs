//! # Polystore Testkit
//!
//! Test utilities for polystore.
//!
//! This crate provides:
//! - A fixture database wired to in-memory backends, with handles to each
//!   backend for fault injection and inspection
//! - Property-based generators using proptest
//! - Concurrent load helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use polystore_testkit::prelude::*;
//!
//! #[test]
//! fn creates_a_user() {
//!     let db = TestDatabase::new();
//!     let user = db.create(&tenant_ctx("t1"), "User", record(json!({"name": "Ann"}))).unwrap();
//!     assert_eq!(user.tenant_id(), Some("t1"));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

use tracing_subscriber::EnvFilter;

/// Routes `tracing` output to the test harness.
///
/// Filtered by `RUST_LOG`; safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_logging;
    pub use crate::stress::*;
    pub use serde_json::json;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
