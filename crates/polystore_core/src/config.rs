//! Database configuration.

use crate::retry::RetryConfig;
use polystore_storage::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default overflow threshold: 1 MiB of canonical encoding.
pub const DEFAULT_OVERFLOW_THRESHOLD: usize = 1024 * 1024;

/// Configuration for a [`crate::Database`].
///
/// Loading from files or the environment is left to the embedding
/// application; the struct derives serde traits for that purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Provider used by relational models without an override.
    pub default_relational_provider: String,

    /// Provider used by document models without an override.
    pub default_document_provider: String,

    /// Pool sizing per provider name.
    pub pools: BTreeMap<String, PoolConfig>,

    /// TTL for cached reads when a model does not set its own.
    /// `None` keeps entries until invalidated.
    pub cache_default_ttl: Option<Duration>,

    /// Whether mutations are recorded in the audit chain.
    pub audit_enabled: bool,

    /// Whether `delete` without `hard` marks records instead of removing them.
    pub soft_delete_enabled: bool,

    /// Encoded record size above which fields are moved to the blob store.
    pub overflow_threshold: usize,

    /// Backoff for transient backend failures.
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_relational_provider: "sql".to_string(),
            default_document_provider: "document".to_string(),
            pools: BTreeMap::new(),
            cache_default_ttl: Some(Duration::from_secs(300)),
            audit_enabled: true,
            soft_delete_enabled: true,
            overflow_threshold: DEFAULT_OVERFLOW_THRESHOLD,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default relational provider.
    #[must_use]
    pub fn default_relational_provider(mut self, name: impl Into<String>) -> Self {
        self.default_relational_provider = name.into();
        self
    }

    /// Sets the default document provider.
    #[must_use]
    pub fn default_document_provider(mut self, name: impl Into<String>) -> Self {
        self.default_document_provider = name.into();
        self
    }

    /// Sets pool sizing for one provider.
    #[must_use]
    pub fn pool(mut self, provider: impl Into<String>, pool: PoolConfig) -> Self {
        self.pools.insert(provider.into(), pool);
        self
    }

    /// Sets the default cache TTL.
    #[must_use]
    pub fn cache_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_default_ttl = ttl;
        self
    }

    /// Enables or disables auditing.
    #[must_use]
    pub const fn audit_enabled(mut self, value: bool) -> Self {
        self.audit_enabled = value;
        self
    }

    /// Enables or disables soft delete.
    #[must_use]
    pub const fn soft_delete_enabled(mut self, value: bool) -> Self {
        self.soft_delete_enabled = value;
        self
    }

    /// Sets the overflow threshold in bytes.
    #[must_use]
    pub const fn overflow_threshold(mut self, bytes: usize) -> Self {
        self.overflow_threshold = bytes;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Pool sizing for `provider`, falling back to [`PoolConfig::default`].
    #[must_use]
    pub fn pool_for(&self, provider: &str) -> PoolConfig {
        self.pools.get(provider).cloned().unwrap_or_default()
    }
}
