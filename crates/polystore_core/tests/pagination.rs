//! Keyset pagination with continuation tokens.

use polystore_core::{CoreError, OrderBy, Page, QuerySpec, RequestContext};
use polystore_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn drain(db: &TestDatabase, ctx: &RequestContext, model: &str, spec: &QuerySpec, size: usize) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = db
            .read_page(ctx, model, spec.clone(), size, token.as_deref())
            .unwrap();
        token = page.next_token.clone();
        pages.push(page);
        if token.is_none() {
            return pages;
        }
    }
}

fn ids(pages: &[Page]) -> Vec<String> {
    pages
        .iter()
        .flat_map(|p| p.records.iter())
        .map(|r| r.id().unwrap().to_string())
        .collect()
}

#[test]
fn pages_cover_every_row_once() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for i in 0..23 {
        db.create(&ctx, "Order", record(json!({"customer": "Ann", "total": i % 5})))
            .unwrap();
    }

    let spec = QuerySpec::new().order_by(OrderBy::desc("total"));
    let pages = drain(&db, &ctx, "Order", &spec, 5);
    assert_eq!(pages.len(), 5);
    assert_eq!(pages[4].records.len(), 3);
    assert!(!pages[4].has_more());

    let seen = ids(&pages);
    assert_eq!(seen.len(), 23);
    assert_eq!(seen.iter().collect::<BTreeSet<_>>().len(), 23);

    let totals: Vec<i64> = pages
        .iter()
        .flat_map(|p| p.records.iter())
        .map(|r| r.get("total").and_then(|v| v.as_integer()).unwrap())
        .collect();
    assert!(totals.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn exact_multiple_ends_without_a_token() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for i in 0..4 {
        db.create(&ctx, "User", record(json!({ "name": format!("u{i}") })))
            .unwrap();
    }
    let pages = drain(&db, &ctx, "User", &QuerySpec::new(), 2);
    assert_eq!(pages.len(), 2);
    assert!(pages.iter().all(|p| p.records.len() == 2));
}

#[test]
fn concurrent_inserts_never_repeat_or_skip_rows() {
    init_test_logging();
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    let originals: BTreeSet<String> = (0..200)
        .map(|i| {
            db.create(&ctx, "User", record(json!({ "name": format!("user-{i:03}") })))
                .unwrap()
                .id()
                .unwrap()
                .to_string()
        })
        .collect();

    let done = AtomicBool::new(false);
    let seen = thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..10 {
                db.create(&ctx, "User", record(json!({ "name": format!("late-{i}") })))
                    .unwrap();
                thread::yield_now();
            }
            done.store(true, Ordering::SeqCst);
        });
        let spec = QuerySpec::new().order_by(OrderBy::asc("name"));
        ids(&drain(&db, &ctx, "User", &spec, 50))
    });
    assert!(done.load(Ordering::SeqCst));

    let unique: BTreeSet<String> = seen.iter().cloned().collect();
    assert_eq!(unique.len(), seen.len(), "a row was returned twice");
    assert!(originals.is_subset(&unique), "a row present throughout was skipped");
    assert!(seen.len() <= 210);
}

#[test]
fn projection_does_not_break_continuation() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for i in 0..5 {
        db.create(&ctx, "User", record(json!({ "name": format!("u{i}"), "age": i })))
            .unwrap();
    }
    let spec = QuerySpec::new().order_by(OrderBy::desc("age")).select(["name"]);
    let pages = drain(&db, &ctx, "User", &spec, 2);

    let names: Vec<&str> = pages
        .iter()
        .flat_map(|p| p.records.iter())
        .map(|r| {
            assert_eq!(r.len(), 1);
            r.get("name").and_then(|v| v.as_text()).unwrap()
        })
        .collect();
    assert_eq!(names, vec!["u4", "u3", "u2", "u1", "u0"]);
}

#[test]
fn tokens_are_bound_to_model_and_ordering() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for i in 0..3 {
        db.create(&ctx, "User", record(json!({ "name": format!("u{i}") })))
            .unwrap();
        db.create(&ctx, "Order", record(json!({ "customer": format!("c{i}") })))
            .unwrap();
    }
    let by_name = QuerySpec::new().order_by(OrderBy::asc("name"));
    let token = db
        .read_page(&ctx, "User", by_name.clone(), 1, None)
        .unwrap()
        .next_token
        .unwrap();

    let reordered = QuerySpec::new().order_by(OrderBy::desc("name"));
    assert!(matches!(
        db.read_page(&ctx, "User", reordered, 1, Some(&token)),
        Err(CoreError::InvalidQuery { .. })
    ));
    assert!(matches!(
        db.read_page(&ctx, "Order", QuerySpec::new(), 1, Some(&token)),
        Err(CoreError::InvalidQuery { .. })
    ));
    assert!(matches!(
        db.read_page(&ctx, "User", by_name.clone(), 1, Some("not a token")),
        Err(CoreError::InvalidQuery { .. })
    ));
    assert!(db.read_page(&ctx, "User", by_name, 1, Some(&token)).is_ok());
}

#[test]
fn nulls_sort_first_ascending_across_pages() {
    let db = TestDatabase::new();
    let ctx = tenant_ctx("t1");
    for total in [Some(3), None, Some(1), None, Some(2)] {
        db.create(&ctx, "Order", record(json!({"customer": "Ann", "total": total})))
            .unwrap();
    }
    let spec = QuerySpec::new().order_by(OrderBy::asc("total"));
    let pages = drain(&db, &ctx, "Order", &spec, 2);
    let totals: Vec<Option<i64>> = pages
        .iter()
        .flat_map(|p| p.records.iter())
        .map(|r| r.get("total").and_then(|v| v.as_integer()))
        .collect();
    assert_eq!(totals, vec![None, None, Some(1), Some(2), Some(3)]);
}
