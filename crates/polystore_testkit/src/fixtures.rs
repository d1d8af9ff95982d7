//! Test fixtures and database helpers.
//!
//! [`TestDatabase`] wires a [`Database`] to in-memory backends and keeps a
//! handle to each one, so tests can inject faults and inspect what reached
//! the backend.

use chrono::{DateTime, TimeZone, Utc};
use polystore_core::{
    CachePolicy, Config, Database, EncryptionKey, FieldDef, FieldEncryption, FixedClock,
    LogAuditStore, MemoryAuditStore, MemoryDocumentClient, MemorySqlClient, ModelSchema, Record,
    RequestContext, SchemaRegistry,
};
use polystore_storage::{FileBackend, InMemoryBlobStore, InMemoryCacheStore};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Relational provider name used by the fixtures.
pub const SQL_PROVIDER: &str = "sql";

/// Document provider name used by the fixtures.
pub const DOCUMENT_PROVIDER: &str = "document";

/// Instant the fixture clock starts at.
pub fn fixture_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid fixture instant")
}

/// Relational `User` model in table `users`.
///
/// `name` is required, `email` is unique, `avatar` is meant for payloads
/// large enough to spill. Results are cached.
pub fn user_schema() -> ModelSchema {
    ModelSchema::relational("User", "users")
        .field(FieldDef::text("name").required())
        .field(FieldDef::text("email").unique())
        .field(FieldDef::text("bio"))
        .field(FieldDef::bytes("avatar"))
        .field(FieldDef::integer("age"))
        .cache(CachePolicy::enabled())
}

/// Document `Order` model in collection `orders`, partitioned by tenant.
pub fn order_schema() -> ModelSchema {
    ModelSchema::document("Order", "orders")
        .field(FieldDef::text("customer").required())
        .field(FieldDef::integer("total"))
        .field(FieldDef::text("status"))
        .field(FieldDef::any("notes"))
}

/// Relational `OrderRow` model in table `order_rows`, with the same user
/// fields as [`order_schema`]. Not part of [`fixture_registry`].
pub fn order_row_schema() -> ModelSchema {
    ModelSchema::relational("OrderRow", "order_rows")
        .field(FieldDef::text("customer").required())
        .field(FieldDef::integer("total"))
        .field(FieldDef::text("status"))
        .field(FieldDef::any("notes"))
}

/// Relational `Patient` model in table `patients` whose `ssn` and
/// `chart` are encrypted at rest. `chart` takes any value, so it can be
/// made large enough to spill. Results are cached.
pub fn patient_schema() -> ModelSchema {
    ModelSchema::relational("Patient", "patients")
        .field(FieldDef::text("name").required())
        .field(FieldDef::text("ssn").encrypted())
        .field(FieldDef::any("chart").encrypted())
        .cache(CachePolicy::enabled())
}

/// Document `Visit` model in collection `visits` with encrypted `notes`.
pub fn visit_schema() -> ModelSchema {
    ModelSchema::document("Visit", "visits")
        .field(FieldDef::text("patient").required())
        .field(FieldDef::text("notes").encrypted())
}

/// [`fixture_registry`] plus [`patient_schema`] and [`visit_schema`].
pub fn encrypted_registry() -> SchemaRegistry {
    fixture_registry()
        .with(patient_schema())
        .and_then(|r| r.with(visit_schema()))
        .expect("encrypted fixture schemas are valid")
}

/// Registry holding [`user_schema`] and [`order_schema`].
pub fn fixture_registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with(user_schema())
        .and_then(|r| r.with(order_schema()))
        .expect("fixture schemas are valid")
}

/// Builds a record from a JSON object literal.
///
/// # Panics
///
/// Panics if `json` is not an object or holds floats.
pub fn record(json: serde_json::Value) -> Record {
    Record::try_from(json).expect("fixture record must be a JSON object without floats")
}

/// Context acting as `alice` in `tenant`.
pub fn tenant_ctx(tenant: &str) -> RequestContext {
    RequestContext::new(tenant, "alice")
}

/// A database over in-memory backends, with handles to each of them.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// Relational backend behind [`SQL_PROVIDER`].
    pub sql: Arc<MemorySqlClient>,
    /// Document backend behind [`DOCUMENT_PROVIDER`].
    pub documents: Arc<MemoryDocumentClient>,
    /// Overflow blob store.
    pub blobs: Arc<InMemoryBlobStore>,
    /// Result cache store.
    pub cache: Arc<InMemoryCacheStore>,
    /// Audit entry store.
    pub audit: Arc<MemoryAuditStore>,
    /// Clock stamping records and audit entries.
    pub clock: Arc<FixedClock>,
}

impl TestDatabase {
    /// Default configuration over [`fixture_registry`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// `config` over [`fixture_registry`].
    pub fn with_config(config: Config) -> Self {
        Self::with_registry(config, fixture_registry())
    }

    /// `config` over `registry`. Relational tables are defined up front so
    /// unique constraints apply.
    pub fn with_registry(config: Config, registry: SchemaRegistry) -> Self {
        Self::assemble(config, registry, None)
    }

    /// `config` over [`encrypted_registry`], sealing with `key`.
    pub fn with_encryption(config: Config, key: EncryptionKey) -> Self {
        Self::assemble(config, encrypted_registry(), Some(FieldEncryption::new(key)))
    }

    fn assemble(
        config: Config,
        registry: SchemaRegistry,
        encryption: Option<FieldEncryption>,
    ) -> Self {
        let sql = Arc::new(MemorySqlClient::named(SQL_PROVIDER));
        for schema in registry.iter() {
            sql.define_table_for(schema);
        }
        let documents = Arc::new(MemoryDocumentClient::named(DOCUMENT_PROVIDER));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let cache = Arc::new(InMemoryCacheStore::new());
        let audit = Arc::new(MemoryAuditStore::new());
        let clock = Arc::new(FixedClock::new(fixture_start()));

        let mut builder = Database::builder(config, registry)
            .relational(SQL_PROVIDER, Arc::clone(&sql))
            .document(DOCUMENT_PROVIDER, Arc::clone(&documents))
            .blob_store(Arc::clone(&blobs) as _)
            .cache_store(Arc::clone(&cache) as _)
            .audit_store(Arc::clone(&audit) as _)
            .clock(Arc::clone(&clock) as _);
        if let Some(encryption) = encryption {
            builder = builder.field_encryption(encryption);
        }
        let db = builder.build().expect("fixture database must build");

        Self {
            db,
            sql,
            documents,
            blobs,
            cache,
            audit,
            clock,
        }
    }

    /// Moves the clock forward by `seconds`.
    pub fn tick(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// A relational backend plus an on-disk audit log that outlive any one
/// [`Database`] opened over them.
pub struct LoggedDatabase {
    /// Relational backend shared by every opened database.
    pub sql: Arc<MemorySqlClient>,
    config: Config,
    _temp_dir: TempDir,
    log_path: PathBuf,
}

impl LoggedDatabase {
    /// Creates the backing directory.
    pub fn new(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log_path = temp_dir.path().join("audit").join("chain.log");
        let sql = Arc::new(MemorySqlClient::named(SQL_PROVIDER));
        for schema in fixture_registry().iter() {
            sql.define_table_for(schema);
        }
        Self {
            sql,
            config,
            _temp_dir: temp_dir,
            log_path,
        }
    }

    /// Path of the audit log file.
    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Opens a database whose audit store replays the log file.
    ///
    /// Only one database should be open at a time: each holds its own tail.
    pub fn open(&self) -> Database {
        let backend = FileBackend::open(&self.log_path).expect("Failed to open audit log");
        let audit = LogAuditStore::open(backend)
            .expect("Failed to replay audit log")
            .sync_on_append(true);
        Database::builder(self.config.clone(), fixture_registry())
            .relational(SQL_PROVIDER, Arc::clone(&self.sql))
            .audit_store(Arc::new(audit))
            .build()
            .expect("logged database must build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fixture_database_routes_both_families() {
        let db = TestDatabase::new();
        let ctx = tenant_ctx("t1");
        db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
        db.create(&ctx, "Order", record(json!({"customer": "Ann", "total": 12})))
            .unwrap();
        assert_eq!(db.sql.rows("users").len(), 1);
        assert_eq!(db.documents.len("orders"), 1);
        assert_eq!(db.audit.len(), 2);
    }

    #[test]
    fn encrypted_fixture_seals_at_rest() {
        let db = TestDatabase::with_encryption(Config::default(), EncryptionKey::generate());
        let ctx = tenant_ctx("t1");
        let patient = db
            .create(&ctx, "Patient", record(json!({"name": "Ann", "ssn": "123-45-6789"})))
            .unwrap();
        assert_eq!(patient.get("ssn").and_then(|v| v.as_text()), Some("123-45-6789"));
        let stored = db.sql.rows("patients").remove(0);
        assert!(FieldEncryption::is_sealed(stored.get_or_null("ssn")));
    }

    #[test]
    fn tick_moves_the_clock() {
        let db = TestDatabase::new();
        let ctx = tenant_ctx("t1");
        let first = db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
        db.tick(5);
        let second = db.create(&ctx, "User", record(json!({"name": "Bob"}))).unwrap();
        assert!(first.created_at() < second.created_at());
    }

    #[test]
    fn logged_database_keeps_the_log_between_opens() {
        let logged = LoggedDatabase::new(Config::default());
        {
            let db = logged.open();
            db.create(&tenant_ctx("t1"), "User", record(json!({"name": "Ann"})))
                .unwrap();
        }
        assert!(logged.log_path().exists());
        let db = logged.open();
        assert_eq!(db.audit_entries("t1", 0, u64::MAX).unwrap().len(), 1);
    }
}
