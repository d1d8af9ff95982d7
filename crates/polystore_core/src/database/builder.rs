//! Assembles a [`Database`] from a schema registry and backends.

use super::gate::WriteGate;
use super::Database;
use crate::adapter::{BackendAdapter, DocumentAdapter, DocumentClient, RelationalAdapter, SqlClient};
use crate::audit::{AuditChain, AuditStore, MemoryAuditStore};
use crate::cache::CacheLayer;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::FieldEncryption;
use crate::error::{CoreError, CoreResult};
use crate::overflow::OverflowManager;
use crate::retry::RetryPolicy;
use crate::schema::{SchemaRegistry, StorageFamily};
use crate::stats::DatabaseStats;
use polystore_storage::{BlobStore, CacheStore, InMemoryBlobStore, InMemoryCacheStore};
use std::collections::HashMap;
use std::sync::Arc;

/// Builder returned by [`Database::builder`].
///
/// Stores left unset default to in-memory implementations.
pub struct DatabaseBuilder {
    config: Config,
    registry: SchemaRegistry,
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    clock: Option<Arc<dyn Clock>>,
    encryption: Option<FieldEncryption>,
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("models", &self.registry.len())
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DatabaseBuilder {
    pub(crate) fn new(config: Config, registry: SchemaRegistry) -> Self {
        Self {
            config,
            registry,
            adapters: HashMap::new(),
            blob_store: None,
            cache_store: None,
            audit_store: None,
            clock: None,
            encryption: None,
        }
    }

    /// Registers a relational provider backed by `client`, pooled per
    /// [`Config::pool_for`].
    #[must_use]
    pub fn relational<C: SqlClient + 'static>(self, name: impl Into<String>, client: C) -> Self {
        let name = name.into();
        let pool = self.config.pool_for(&name);
        self.adapter(Arc::new(RelationalAdapter::new(name, client, pool)))
    }

    /// Registers a document provider backed by `client`.
    #[must_use]
    pub fn document<C: DocumentClient + 'static>(self, name: impl Into<String>, client: C) -> Self {
        let name = name.into();
        let pool = self.config.pool_for(&name);
        self.adapter(Arc::new(DocumentAdapter::new(name, client, pool)))
    }

    /// Registers a custom adapter under its own name.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    /// Sets the store for overflowed fields.
    #[must_use]
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Sets the result cache store.
    #[must_use]
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Sets the audit store.
    #[must_use]
    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    /// Sets the time source for record and audit timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the key material for encrypted fields.
    #[must_use]
    pub fn field_encryption(mut self, encryption: FieldEncryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Resolves every model to an adapter and builds the database.
    ///
    /// # Errors
    ///
    /// `ProviderNotConfigured` if a model's provider has no adapter,
    /// `InvalidSchema` if the adapter serves the other storage family or
    /// a model declares encrypted fields and no key is configured.
    pub fn build(self) -> CoreResult<Database> {
        let mut routes = HashMap::new();
        for schema in self.registry.iter() {
            if self.encryption.is_none() && schema.encrypted_fields().next().is_some() {
                return Err(CoreError::invalid_schema(
                    &schema.name,
                    "encrypted fields need a field encryption key",
                ));
            }
            let provider = match (&schema.provider, schema.family) {
                (Some(provider), _) => provider.clone(),
                (None, StorageFamily::Relational) => self.config.default_relational_provider.clone(),
                (None, StorageFamily::Document) => self.config.default_document_provider.clone(),
            };
            let adapter = self
                .adapters
                .get(&provider)
                .ok_or_else(|| CoreError::ProviderNotConfigured {
                    provider: provider.clone(),
                })?;
            if adapter.family() != schema.family {
                return Err(CoreError::invalid_schema(
                    &schema.name,
                    format!("provider {provider} serves {:?} models", adapter.family()),
                ));
            }
            routes.insert(schema.name.clone(), Arc::clone(adapter));
        }

        let stats = Arc::new(DatabaseStats::new());
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let blobs = self
            .blob_store
            .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let cache_store = self
            .cache_store
            .unwrap_or_else(|| Arc::new(InMemoryCacheStore::new()));
        let audit = self.config.audit_enabled.then(|| {
            let store = self
                .audit_store
                .unwrap_or_else(|| Arc::new(MemoryAuditStore::new()));
            AuditChain::new(store, Arc::clone(&clock)).with_stats(Arc::clone(&stats))
        });

        tracing::info!(
            models = self.registry.len(),
            providers = self.adapters.len(),
            audit = self.config.audit_enabled,
            encryption = self.encryption.is_some(),
            soft_delete = self.config.soft_delete_enabled,
            overflow_threshold = self.config.overflow_threshold,
            "database built"
        );

        Ok(Database {
            overflow: OverflowManager::new(blobs, self.config.overflow_threshold)
                .with_stats(Arc::clone(&stats)),
            cache: CacheLayer::new(cache_store, self.config.cache_default_ttl)
                .with_stats(Arc::clone(&stats)),
            retry: RetryPolicy::new(self.config.retry.clone()).with_stats(Arc::clone(&stats)),
            config: self.config,
            registry: self.registry,
            routes,
            audit,
            encryption: self.encryption,
            gate: WriteGate::new(),
            clock,
            stats,
        })
    }
}
