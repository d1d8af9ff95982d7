//! Behavior shared by the relational and document families.

use polystore_core::{
    Config, Operator, QuerySpec, QueryWarning, ReadOptions, Record, RequestContext, SchemaRegistry,
    Value,
};
use polystore_testkit::prelude::*;
use proptest::prelude::*;

fn mirrored_db() -> TestDatabase {
    let registry = SchemaRegistry::new()
        .with(order_schema())
        .and_then(|r| r.with(order_row_schema()))
        .unwrap();
    TestDatabase::with_registry(Config::default(), registry)
}

fn summary(records: &[Record]) -> Vec<(String, Value, Value, Value)> {
    records
        .iter()
        .map(|r| {
            (
                r.id().unwrap().to_string(),
                r.get_or_null("customer").clone(),
                r.get_or_null("total").clone(),
                r.get_or_null("status").clone(),
            )
        })
        .collect()
}

#[test]
fn tenant_reads_scan_one_partition() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for customer in ["ann", "bob", "carla"] {
        db.create(&ctx, "Order", record(json!({ "customer": customer })))
            .unwrap();
    }
    db.create(&tenant_ctx("t2"), "Order", record(json!({"customer": "ann"})))
        .unwrap();

    let found = db
        .read(&ctx, "Order", QuerySpec::new().eq("customer", "ann"), &ReadOptions::new())
        .unwrap();
    assert_eq!(found.len(), 1);
    let counts = db.documents.scan_counts();
    assert_eq!(counts.partition, 1);
    assert_eq!(counts.full, 0);
    assert_eq!(counts.examined, 3);
}

#[test]
fn id_lookups_are_point_reads() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    let order = db.create(&ctx, "Order", record(json!({"customer": "ann"}))).unwrap();
    let before = db.documents.scan_counts();

    let read = db
        .read_one(&ctx, "Order", order.id().unwrap(), &ReadOptions::new())
        .unwrap();
    assert_eq!(read, order);
    let after = db.documents.scan_counts();
    assert_eq!(after.point, before.point + 1);
    assert_eq!(after.partition, before.partition);
}

#[test]
fn cross_tenant_reads_warn_about_full_scans() {
    let db = TestDatabase::new();
    for tenant in ["t1", "t2"] {
        db.create(&tenant_ctx(tenant), "Order", record(json!({"customer": "ann"})))
            .unwrap();
    }
    let admin = RequestContext::new("ops", "root").admin_bypass(true);

    let output = db
        .query(&admin, "Order", QuerySpec::new(), &ReadOptions::new())
        .unwrap();
    assert_eq!(output.records.len(), 2);
    assert!(output
        .warnings
        .contains(&QueryWarning::FullScan { model: "Order".into() }));
    assert_eq!(db.documents.scan_counts().full, 1);
}

#[test]
fn relational_reads_push_filters_into_sql() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    db.create(&ctx, "User", record(json!({"name": "Ann", "age": 41})))
        .unwrap();
    db.sql.clear_history();

    db.read(
        &ctx,
        "User",
        QuerySpec::new().filter("age", Operator::Gte, 18i64),
        &ReadOptions::new().no_cache(),
    )
    .unwrap();
    let statement = db.sql.history().pop().unwrap();
    assert!(statement.text.starts_with("SELECT * FROM \"users\" WHERE"));
    assert!(statement.text.contains("\"age\" >= $"));
    assert!(statement.params.contains(&Value::Integer(18)));
    assert!(statement.params.contains(&Value::from("t1")));
}

#[test]
fn missing_and_null_fields_match_eq_null() {
    let db = mirrored_db();
    let ctx = tenant_ctx("t1");
    for model in ["Order", "OrderRow"] {
        db.create(&ctx, model, record(json!({"customer": "ann"}))).unwrap();
        db.create(&ctx, model, record(json!({"customer": "bob", "total": null})))
            .unwrap();
        db.create(&ctx, model, record(json!({"customer": "carla", "total": 3})))
            .unwrap();

        let spec = QuerySpec::new().eq("total", Value::Null);
        assert_eq!(db.count(&ctx, model, spec, &ReadOptions::new()).unwrap(), 2);
        let spec = QuerySpec::new().filter("total", Operator::Ne, Value::Null);
        assert_eq!(db.count(&ctx, model, spec, &ReadOptions::new()).unwrap(), 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn both_families_answer_alike(
        rows in prop::collection::vec(order_fields_strategy(), 0..16),
        spec in order_spec_strategy(),
    ) {
        let db = mirrored_db();
        let ctx = tenant_ctx("t1");
        for (i, fields) in rows.into_iter().enumerate() {
            let fields = fields.with("id", format!("o-{i:02}"));
            db.create(&ctx, "Order", fields.clone()).unwrap();
            db.create(&ctx, "OrderRow", fields).unwrap();
        }

        let documents = db.read(&ctx, "Order", spec.clone(), &ReadOptions::new()).unwrap();
        let rows = db.read(&ctx, "OrderRow", spec.clone(), &ReadOptions::new()).unwrap();
        prop_assert_eq!(summary(&documents), summary(&rows));

        let counted = db.count(&ctx, "Order", spec.clone(), &ReadOptions::new()).unwrap();
        prop_assert_eq!(counted, documents.len() as u64);
        prop_assert_eq!(db.count(&ctx, "OrderRow", spec, &ReadOptions::new()).unwrap(), counted);
    }
}
