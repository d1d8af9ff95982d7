//! Result caching and invalidation.

use polystore_core::{
    AuditEntry, AuditStore, Config, CoreError, CoreResult, Database, MemoryAuditStore,
    MemorySqlClient, QuerySpec, ReadOptions, RequestContext,
};
use polystore_storage::{CacheStore, InMemoryCacheStore, StorageResult};
use polystore_testkit::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A second database sharing the relational backend but not the cache.
fn outside_writer(db: &TestDatabase) -> Database {
    Database::builder(Config::default(), fixture_registry())
        .relational(SQL_PROVIDER, Arc::clone(&db.sql))
        .build()
        .unwrap()
}

fn names(db: &Database, ctx: &RequestContext, options: &ReadOptions) -> Vec<String> {
    let mut names: Vec<String> = db
        .read(ctx, "User", QuerySpec::new(), options)
        .unwrap()
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_text()).map(str::to_string))
        .collect();
    names.sort();
    names
}

#[test]
fn repeated_reads_hit_the_cache() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();

    let first = names(&db, &ctx, &ReadOptions::new());
    db.sql.clear_history();
    let second = names(&db, &ctx, &ReadOptions::new());

    assert_eq!(first, second);
    assert!(db.sql.history().is_empty());
    let stats = db.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[test]
fn own_writes_invalidate() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    let ann = db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann"]);

    db.create(&ctx, "User", record(json!({"name": "Bob"}))).unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann", "Bob"]);

    db.update(&ctx, "User", ann.id().unwrap(), record(json!({"name": "Anna"})))
        .unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Anna", "Bob"]);

    db.delete(&ctx, "User", ann.id().unwrap(), false).unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Bob"]);
}

#[test]
fn outside_writes_stay_stale_until_invalidated() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann"]);

    outside_writer(&db)
        .create(&ctx, "User", record(json!({"name": "Bob"})))
        .unwrap();

    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann"]);
    assert_eq!(names(&db, &ctx, &ReadOptions::new().no_cache()), vec!["Ann", "Bob"]);

    db.invalidate_cache(&ctx, "User").unwrap();
    db.invalidate_cache(&ctx, "User").unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann", "Bob"]);
    assert_eq!(db.stats().cache_invalidations, 3);
}

#[test]
fn counts_are_cached_separately_from_rows() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();

    assert_eq!(names(&db, &ctx, &ReadOptions::new()).len(), 1);
    assert_eq!(db.count(&ctx, "User", QuerySpec::new(), &ReadOptions::new()).unwrap(), 1);
    assert_eq!(db.count(&ctx, "User", QuerySpec::new(), &ReadOptions::new()).unwrap(), 1);
    let stats = db.stats();
    assert_eq!(stats.cache_misses, 2);
    assert_eq!(stats.cache_hits, 1);
}

#[test]
fn tenants_never_share_entries() {
    let db = TestDatabase::new();
    db.create(&tenant_ctx("t1"), "User", record(json!({"name": "Ann"})))
        .unwrap();
    db.create(&tenant_ctx("t2"), "User", record(json!({"name": "Bob"})))
        .unwrap();

    assert_eq!(names(&db, &tenant_ctx("t1"), &ReadOptions::new()), vec!["Ann"]);
    assert_eq!(names(&db, &tenant_ctx("t2"), &ReadOptions::new()), vec!["Bob"]);

    db.create(&tenant_ctx("t2"), "User", record(json!({"name": "Carla"})))
        .unwrap();
    db.sql.clear_history();
    assert_eq!(names(&db, &tenant_ctx("t1"), &ReadOptions::new()), vec!["Ann"]);
    assert!(db.sql.history().is_empty());
}

#[test]
fn admin_reads_bypass_the_cache() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
    let admin = RequestContext::new("ops", "root").admin_bypass(true);

    names(&db, &admin, &ReadOptions::new());
    names(&db, &admin, &ReadOptions::new());
    let stats = db.stats();
    assert_eq!(stats.cache_hits + stats.cache_misses, 0);
    assert_eq!(stats.reads, 2);
}

#[test]
fn uncached_models_always_read_the_backend() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "Order", record(json!({"customer": "Ann"}))).unwrap();
    db.read(&ctx, "Order", QuerySpec::new(), &ReadOptions::new()).unwrap();
    db.read(&ctx, "Order", QuerySpec::new(), &ReadOptions::new()).unwrap();
    assert_eq!(db.stats().cache_misses, 0);
    assert_eq!(db.documents.scan_counts().partition, 2);
}

#[test]
fn clearing_drops_every_entry() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
    names(&db, &ctx, &ReadOptions::new());
    assert!(!db.cache.is_empty());

    db.clear_cache().unwrap();
    assert!(db.cache.is_empty());
    names(&db, &ctx, &ReadOptions::new());
    assert_eq!(db.stats().cache_misses, 2);
}

#[test]
fn failed_audit_append_still_invalidates() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    let ann = db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann"]);

    db.audit.fail_next(1);
    let err = db
        .update(&ctx, "User", ann.id().unwrap(), record(json!({"name": "Anna"})))
        .unwrap_err();
    assert!(matches!(err, CoreError::AuditWrite { .. }), "got {err:?}");

    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Anna"]);
    assert_eq!(db.stats().cache_misses, 2);
}

/// Shared log of audit appends and cache generation bumps.
type Events = Arc<Mutex<Vec<&'static str>>>;

struct RecordingCache {
    inner: InMemoryCacheStore,
    events: Events,
}

impl CacheStore for RecordingCache {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        if key.starts_with("pcg:") {
            self.events.lock().unwrap().push("invalidate");
        }
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        self.inner.delete(key)
    }

    fn clear(&self) -> StorageResult<()> {
        self.inner.clear()
    }

    fn purge_expired(&self) -> StorageResult<usize> {
        self.inner.purge_expired()
    }
}

struct RecordingAudit {
    inner: MemoryAuditStore,
    events: Events,
}

impl AuditStore for RecordingAudit {
    fn append(&self, entry: &AuditEntry) -> CoreResult<()> {
        self.events.lock().unwrap().push("audit");
        self.inner.append(entry)
    }

    fn last(&self, tenant: &str) -> CoreResult<Option<AuditEntry>> {
        self.inner.last(tenant)
    }

    fn range(&self, tenant: &str, from: u64, to: u64) -> CoreResult<Vec<AuditEntry>> {
        self.inner.range(tenant, from, to)
    }

    fn tenants(&self) -> CoreResult<Vec<String>> {
        self.inner.tenants()
    }
}

#[test]
fn audit_is_appended_before_invalidation() {
    let events = Events::default();
    let sql = Arc::new(MemorySqlClient::named(SQL_PROVIDER));
    for schema in fixture_registry().iter() {
        sql.define_table_for(schema);
    }
    let db = Database::builder(Config::default(), fixture_registry())
        .relational(SQL_PROVIDER, Arc::clone(&sql))
        .cache_store(Arc::new(RecordingCache {
            inner: InMemoryCacheStore::new(),
            events: Arc::clone(&events),
        }))
        .audit_store(Arc::new(RecordingAudit {
            inner: MemoryAuditStore::new(),
            events: Arc::clone(&events),
        }))
        .build()
        .unwrap();
    let ctx = tenant_ctx("t1");

    let ann = db.create(&ctx, "User", record(json!({"name": "Ann"}))).unwrap();
    assert_eq!(names(&db, &ctx, &ReadOptions::new()), vec!["Ann"]);
    db.update(&ctx, "User", ann.id().unwrap(), record(json!({"name": "Anna"})))
        .unwrap();
    db.delete(&ctx, "User", ann.id().unwrap(), false).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events.iter().rev().take(4).rev().copied().collect::<Vec<_>>(),
        vec!["audit", "invalidate", "audit", "invalidate"]
    );
    assert_eq!(events.iter().filter(|e| **e == "audit").count(), 3);
}
