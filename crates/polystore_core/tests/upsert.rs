//! Create-or-update by caller-chosen id.

use polystore_core::translate::SqlStatement;
use polystore_core::{
    AuditAction, BatchOptions, CancelToken, Config, CoreError, CoreResult, Database,
    MemoryAuditStore, MemorySqlClient, ReadOptions, RetryConfig, SqlClient, SqlOutcome, Value,
};
use polystore_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn actions(db: &TestDatabase, tenant: &str) -> Vec<AuditAction> {
    db.audit_entries(tenant, 0, u64::MAX)
        .unwrap()
        .iter()
        .map(|e| e.action)
        .collect()
}

#[test]
fn first_upsert_creates_and_later_ones_update() {
    init_test_logging();
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");

    let created = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();
    assert_eq!(created.id(), Some("u1"));
    assert_eq!(created.created_by(), Some("alice"));

    db.tick(60);
    let updated = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann", "bio": "hi"})), false)
        .unwrap();
    assert_eq!(updated.get("bio"), Some(&Value::from("hi")));
    assert_eq!(updated.created_at(), created.created_at());
    assert_eq!(db.sql.rows("users").len(), 1);

    let entries = db.audit_entries("t1", 0, u64::MAX).unwrap();
    assert_eq!(actions(&db, "t1"), vec![AuditAction::Create, AuditAction::Update]);
    assert_eq!(
        entries[1].changed_fields.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["bio", "updated_at"]
    );

    // Same content again: nothing to write, nothing to audit.
    db.upsert(&ctx, "User", record(json!({"id": "u1", "bio": "hi"})), false)
        .unwrap();
    assert_eq!(db.audit_entries("t1", 0, u64::MAX).unwrap().len(), 2);
}

#[test]
fn replace_clears_fields_left_out() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.upsert(
        &ctx,
        "User",
        record(json!({"id": "u1", "name": "Ann", "bio": "hi", "age": 40, "nickname": "annie"})),
        false,
    )
    .unwrap();

    let replaced = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), true)
        .unwrap();
    assert_eq!(replaced.get_or_null("bio"), &Value::Null);
    assert_eq!(replaced.get_or_null("age"), &Value::Null);
    assert_eq!(replaced.get_or_null("nickname"), &Value::Null);
    assert_eq!(replaced.get("name"), Some(&Value::from("Ann")));

    let entry = db.audit_entries("t1", 1, 2).unwrap().remove(0);
    assert_eq!(entry.changed_fields["age"].old, Value::from(40));
    assert_eq!(entry.changed_fields["age"].new, Value::Null);
    assert!(!entry.changed_fields.contains_key("name"));
    assert!(!entry.changed_fields.contains_key("email"));
}

#[test]
fn replace_still_needs_required_fields() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();

    let err = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "bio": "hi"})), true)
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }), "got {err:?}");
    let merged = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "bio": "hi"})), false)
        .unwrap();
    assert_eq!(merged.get("name"), Some(&Value::from("Ann")));
}

#[test]
fn upsert_revives_a_soft_deleted_record() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();
    db.delete(&ctx, "User", "u1", false).unwrap();

    let revived = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();
    assert!(!revived.is_deleted());
    db.read_one(&ctx, "User", "u1", &ReadOptions::new()).unwrap();

    let entry = db.audit_entries("t1", 2, 3).unwrap().remove(0);
    assert_eq!(entry.action, AuditAction::Update);
    assert_eq!(entry.changed_fields["deleted_at"].new, Value::Null);
    assert_eq!(entry.changed_fields["deleted_by"].old, Value::from("alice"));
}

#[test]
fn upsert_needs_an_id() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for fields in [json!({"name": "Ann"}), json!({"id": "", "name": "Ann"})] {
        let err = db.upsert(&ctx, "User", record(fields), false).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }), "got {err:?}");
    }
    assert!(db.sql.rows("users").is_empty());
    assert!(db.audit.is_empty());
}

#[test]
fn relational_ids_held_by_another_tenant_conflict() {
    let db = TestDatabase::new();
    db.upsert(&tenant_ctx("t1"), "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();

    let err = db
        .upsert(&tenant_ctx("t2"), "User", record(json!({"id": "u1", "name": "Eve"})), false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }), "got {err:?}");
    let rows = db.sql.rows("users");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::from("Ann")));
    assert!(actions(&db, "t2").is_empty());
}

#[test]
fn document_upserts_stay_within_the_tenant_partition() {
    let db = TestDatabase::new();
    for tenant in ["t1", "t2"] {
        db.upsert(
            &tenant_ctx(tenant),
            "Order",
            record(json!({"id": "o1", "customer": tenant, "total": 1})),
            false,
        )
        .unwrap();
    }
    let order = db
        .upsert(&tenant_ctx("t1"), "Order", record(json!({"id": "o1", "total": 2})), false)
        .unwrap();
    assert_eq!(order.get("customer"), Some(&Value::from("t1")));
    assert_eq!(order.get("total"), Some(&Value::from(2)));

    assert_eq!(actions(&db, "t1"), vec![AuditAction::Create, AuditAction::Update]);
    assert_eq!(actions(&db, "t2"), vec![AuditAction::Create]);
    let other = db
        .read_one(&tenant_ctx("t2"), "Order", "o1", &ReadOptions::new())
        .unwrap();
    assert_eq!(other.get("total"), Some(&Value::from(1)));
}

#[test]
fn bulk_upsert_mixes_creates_and_updates() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();

    let result = db
        .bulk_upsert(
            &ctx,
            "User",
            vec![
                record(json!({"id": "u1", "name": "Anna"})),
                record(json!({"id": "u2", "name": "Bob"})),
                record(json!({"name": "Carla"})),
            ],
            false,
            &BatchOptions::new().chunk_size(2),
        )
        .unwrap();
    assert_eq!(result.succeeded.len(), 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 2);
    assert_eq!(
        actions(&db, "t1"),
        vec![AuditAction::Create, AuditAction::Update, AuditAction::Create]
    );
    assert_eq!(db.sql.rows("users").len(), 2);
}

/// Applies every statement, but drops the reply to the first `remaining` inserts.
struct LostInsertReplies {
    inner: Arc<MemorySqlClient>,
    remaining: AtomicUsize,
}

impl SqlClient for LostInsertReplies {
    fn execute(&self, statement: &SqlStatement, cancel: &CancelToken) -> CoreResult<SqlOutcome> {
        let outcome = self.inner.execute(statement, cancel)?;
        let lose = matches!(statement, SqlStatement::Insert(_))
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lose {
            return Err(CoreError::connection("sql", "reply lost", true));
        }
        Ok(outcome)
    }
}

#[test]
fn lost_insert_reply_is_retried_and_audited_once() {
    let sql = Arc::new(MemorySqlClient::named(SQL_PROVIDER));
    for schema in fixture_registry().iter() {
        sql.define_table_for(schema);
    }
    let audit = Arc::new(MemoryAuditStore::new());
    let config = Config::default().retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
    );
    let db = Database::builder(config, fixture_registry())
        .relational(
            SQL_PROVIDER,
            LostInsertReplies {
                inner: Arc::clone(&sql),
                remaining: AtomicUsize::new(1),
            },
        )
        .audit_store(Arc::clone(&audit) as _)
        .build()
        .unwrap();
    let ctx = tenant_ctx("t1");

    let user = db
        .upsert(&ctx, "User", record(json!({"id": "u1", "name": "Ann"})), false)
        .unwrap();
    assert_eq!(user.get("name"), Some(&Value::from("Ann")));
    assert_eq!(sql.rows("users").len(), 1);
    assert_eq!(db.stats().retries, 1);

    let entries = db.audit_entries("t1", 0, u64::MAX).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::Create);
    assert_eq!(entries[0].changed_fields["name"].new, Value::from("Ann"));
}
