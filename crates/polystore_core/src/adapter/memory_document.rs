//! In-process document store partitioned by key.

use super::document::{DocumentClient, ReplaceOutcome, StoredDocument};
use super::DocumentKey;
use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::translate::KeyScope;
use parking_lot::{Mutex, RwLock};
use polystore_codec::{encode_canonical, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

const SCAN_CHECK_INTERVAL: usize = 256;

/// A document and the version that wrote it.
#[derive(Debug, Clone)]
struct Versioned {
    document: Record,
    version: u64,
}

/// Rows of one partition, ordered by the canonical encoding of the row key.
type Partition = BTreeMap<Vec<u8>, Versioned>;

/// Partitions of one collection, ordered the same way.
type Collection = BTreeMap<Vec<u8>, Partition>;

/// How many scans of each kind, and how many documents they visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanCounts {
    /// Point lookups.
    pub point: u64,
    /// Single-partition scans.
    pub partition: u64,
    /// Cross-partition row-key lookups.
    pub row: u64,
    /// Whole-collection scans.
    pub full: u64,
    /// Documents visited across all scans.
    pub examined: u64,
}

/// Reference [`DocumentClient`] holding collections in memory.
#[derive(Debug)]
pub struct MemoryDocumentClient {
    name: String,
    collections: RwLock<HashMap<String, Collection>>,
    /// Last version handed out; versions are never reused.
    versions: AtomicU64,
    failures: Mutex<usize>,
    point: AtomicU64,
    partition: AtomicU64,
    row: AtomicU64,
    full: AtomicU64,
    examined: AtomicU64,
}

impl Default for MemoryDocumentClient {
    fn default() -> Self {
        Self::new()
    }
}

fn key_bytes(value: &Value) -> Vec<u8> {
    encode_canonical(value)
}

fn etag(version: u64) -> String {
    format!("\"{version:x}\"")
}

impl MemoryDocumentClient {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory-document")
    }

    /// Creates an empty store reporting `name` in connection errors.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: RwLock::new(HashMap::new()),
            versions: AtomicU64::new(0),
            failures: Mutex::new(0),
            point: AtomicU64::new(0),
            partition: AtomicU64::new(0),
            row: AtomicU64::new(0),
            full: AtomicU64::new(0),
            examined: AtomicU64::new(0),
        }
    }

    /// Makes the next `n` calls fail without applying.
    pub fn fail_next(&self, n: usize) {
        *self.failures.lock() = n;
    }

    /// Scan counters since creation.
    pub fn scan_counts(&self) -> ScanCounts {
        ScanCounts {
            point: self.point.load(Ordering::Relaxed),
            partition: self.partition.load(Ordering::Relaxed),
            row: self.row.load(Ordering::Relaxed),
            full: self.full.load(Ordering::Relaxed),
            examined: self.examined.load(Ordering::Relaxed),
        }
    }

    /// Number of documents stored in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.values().map(BTreeMap::len).sum())
    }

    /// Returns true if `collection` holds no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Raw stored document, bypassing every counter.
    pub fn peek(&self, collection: &str, key: &DocumentKey) -> Option<Record> {
        self.stored(collection, key).map(|stored| stored.document)
    }

    fn stored(&self, collection: &str, key: &DocumentKey) -> Option<StoredDocument> {
        let collections = self.collections.read();
        let versioned = collections
            .get(collection)?
            .get(&key_bytes(&key.partition))?
            .get(&key_bytes(&key.row))?;
        Some(StoredDocument {
            document: versioned.document.clone(),
            etag: etag(versioned.version),
        })
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn injected(&self) -> CoreResult<()> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(CoreError::connection(&self.name, "injected failure", false));
        }
        Ok(())
    }
}

impl DocumentClient for MemoryDocumentClient {
    fn get(&self, collection: &str, key: &DocumentKey) -> CoreResult<Option<StoredDocument>> {
        self.injected()?;
        self.point.fetch_add(1, Ordering::Relaxed);
        Ok(self.stored(collection, key))
    }

    fn insert(&self, collection: &str, key: &DocumentKey, document: &Record) -> CoreResult<()> {
        self.injected()?;
        let mut collections = self.collections.write();
        let partition = collections
            .entry(collection.to_string())
            .or_default()
            .entry(key_bytes(&key.partition))
            .or_default();
        let row = key_bytes(&key.row);
        if partition.contains_key(&row) {
            return Err(CoreError::conflict(
                collection,
                "row key",
                format!("document {} already exists in partition {}", key.row, key.partition),
            ));
        }
        let version = self.next_version();
        partition.insert(
            row,
            Versioned {
                document: document.clone(),
                version,
            },
        );
        Ok(())
    }

    fn replace(
        &self,
        collection: &str,
        key: &DocumentKey,
        document: &Record,
        if_match: &str,
    ) -> CoreResult<ReplaceOutcome> {
        self.injected()?;
        let mut collections = self.collections.write();
        let slot = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(&key_bytes(&key.partition)))
            .and_then(|p| p.get_mut(&key_bytes(&key.row)));
        let Some(existing) = slot else {
            return Ok(ReplaceOutcome::Missing);
        };
        if etag(existing.version) != if_match {
            return Ok(ReplaceOutcome::Stale);
        }
        *existing = Versioned {
            document: document.clone(),
            version: self.next_version(),
        };
        Ok(ReplaceOutcome::Replaced)
    }

    fn remove(&self, collection: &str, key: &DocumentKey) -> CoreResult<bool> {
        self.injected()?;
        let mut collections = self.collections.write();
        let Some(partitions) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let partition_key = key_bytes(&key.partition);
        let Some(partition) = partitions.get_mut(&partition_key) else {
            return Ok(false);
        };
        let removed = partition.remove(&key_bytes(&key.row)).is_some();
        if partition.is_empty() {
            partitions.remove(&partition_key);
        }
        Ok(removed)
    }

    fn scan(&self, collection: &str, scope: &KeyScope, cancel: &CancelToken) -> CoreResult<Vec<Record>> {
        self.injected()?;
        let collections = self.collections.read();
        let Some(partitions) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        match scope {
            KeyScope::Point { partition, row } => {
                self.point.fetch_add(1, Ordering::Relaxed);
                if let Some(stored) = partitions
                    .get(&key_bytes(partition))
                    .and_then(|p| p.get(&key_bytes(row)))
                {
                    out.push(stored.document.clone());
                }
            }
            KeyScope::Partition(partition) => {
                self.partition.fetch_add(1, Ordering::Relaxed);
                if let Some(p) = partitions.get(&key_bytes(partition)) {
                    for (i, stored) in p.values().enumerate() {
                        if i % SCAN_CHECK_INTERVAL == 0 {
                            cancel.check("document scan")?;
                        }
                        out.push(stored.document.clone());
                    }
                }
            }
            KeyScope::Row(row) => {
                self.row.fetch_add(1, Ordering::Relaxed);
                let row = key_bytes(row);
                for p in partitions.values() {
                    cancel.check("document scan")?;
                    if let Some(stored) = p.get(&row) {
                        out.push(stored.document.clone());
                    }
                }
            }
            KeyScope::Full => {
                self.full.fetch_add(1, Ordering::Relaxed);
                for (i, stored) in partitions.values().flat_map(BTreeMap::values).enumerate() {
                    if i % SCAN_CHECK_INTERVAL == 0 {
                        cancel.check("document scan")?;
                    }
                    out.push(stored.document.clone());
                }
            }
        }
        self.examined.fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{BackendAdapter, DocumentAdapter, RecordKey};
    use crate::query::{Operator, OrderBy, QuerySpec};
    use crate::schema::{FieldDef, ModelSchema};
    use crate::translate::QueryWarning;
    use polystore_storage::PoolConfig;
    use std::sync::Arc;

    fn orders() -> ModelSchema {
        ModelSchema::document("Order", "orders")
            .field(FieldDef::text("status"))
            .field(FieldDef::integer("total"))
    }

    fn adapter() -> DocumentAdapter<MemoryDocumentClient> {
        let adapter = DocumentAdapter::new("docs", MemoryDocumentClient::new(), PoolConfig::default());
        let schema = orders();
        for (tenant, id, status, total) in [
            ("t1", "o1", "open", 10i64),
            ("t1", "o2", "closed", 25),
            ("t1", "o3", "open", 40),
            ("t2", "o4", "open", 99),
        ] {
            let doc = Record::new()
                .with("id", id)
                .with("tenant_id", tenant)
                .with("status", status)
                .with("total", total);
            adapter.create(&schema, &doc).unwrap();
        }
        adapter
    }

    #[test]
    fn tenant_predicate_scans_one_partition() {
        let adapter = adapter();
        let spec = QuerySpec::new()
            .eq("tenant_id", "t1")
            .eq("status", "open")
            .order_by(OrderBy::desc("total"));
        let out = adapter.read(&orders(), &spec, &CancelToken::new()).unwrap();
        let ids: Vec<_> = out.records.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["o3", "o1"]);
        let counts = adapter.client().scan_counts();
        assert_eq!(counts.partition, 1);
        assert_eq!(counts.full, 0);
        assert_eq!(counts.examined, 3);
    }

    #[test]
    fn point_lookup_examines_one_document() {
        let adapter = adapter();
        let spec = QuerySpec::new().eq("tenant_id", "t2").eq("id", "o4");
        let out = adapter.read(&orders(), &spec, &CancelToken::new()).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(adapter.client().scan_counts().examined, 1);
    }

    #[test]
    fn unkeyed_paging_reports_warnings() {
        let adapter = adapter();
        let spec = QuerySpec::new()
            .filter("total", Operator::Gte, 20i64)
            .order_by(OrderBy::asc("status"))
            .take(2);
        let out = adapter.read(&orders(), &spec, &CancelToken::new()).unwrap();
        assert_eq!(out.records.len(), 2);
        assert!(out.warnings.contains(&QueryWarning::FullScan { model: "Order".into() }));
        assert!(out
            .warnings
            .contains(&QueryWarning::UnstablePagination { model: "Order".into() }));
    }

    #[test]
    fn duplicate_key_conflicts_with_model_name() {
        let adapter = adapter();
        let dup = Record::new().with("id", "o1").with("tenant_id", "t1");
        let err = adapter.create(&orders(), &dup).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { ref model, .. } if model == "Order"));
    }

    #[test]
    fn update_diffs_and_rejects_key_changes() {
        let adapter = adapter();
        let schema = orders();
        let stored = Record::new()
            .with("id", "o1")
            .with("tenant_id", "t1")
            .with("status", "open")
            .with("total", 10i64);
        let key = RecordKey::of(&schema, &stored).unwrap();

        let outcome = adapter
            .update(&schema, &key, &stored.clone().with("status", "shipped"), &Record::new())
            .unwrap();
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.record.get("status"), Some(&Value::from("shipped")));

        let moved = stored.with("tenant_id", "t9");
        assert!(matches!(
            adapter.update(&schema, &key, &moved, &Record::new()),
            Err(CoreError::Validation { .. })
        ));
    }

    fn order_key(tenant: &str, id: &str) -> RecordKey {
        RecordKey {
            id: id.into(),
            document: Some(DocumentKey {
                partition: Value::from(tenant),
                row: Value::from(id),
            }),
        }
    }

    #[test]
    fn replace_requires_current_etag() {
        let client = MemoryDocumentClient::new();
        let key = DocumentKey {
            partition: Value::from("t1"),
            row: Value::from("o1"),
        };
        let doc = Record::new().with("id", "o1").with("status", "open");
        client.insert("orders", &key, &doc).unwrap();
        let first = client.get("orders", &key).unwrap().unwrap();

        let shipped = doc.clone().with("status", "shipped");
        assert_eq!(
            client.replace("orders", &key, &shipped, &first.etag).unwrap(),
            ReplaceOutcome::Replaced
        );
        let second = client.get("orders", &key).unwrap().unwrap();
        assert_ne!(second.etag, first.etag);
        assert_eq!(
            client.replace("orders", &key, &doc, &first.etag).unwrap(),
            ReplaceOutcome::Stale
        );
        assert_eq!(client.peek("orders", &key), Some(shipped));

        let absent = DocumentKey {
            partition: Value::from("t1"),
            row: Value::from("o9"),
        };
        assert_eq!(
            client.replace("orders", &absent, &doc, &first.etag).unwrap(),
            ReplaceOutcome::Missing
        );
    }

    #[test]
    fn concurrent_field_updates_keep_both_fields() {
        let schema = orders();
        for _ in 0..200 {
            let adapter = Arc::new(adapter());
            let key = order_key("t1", "o1");
            let writers: Vec<_> = [("status", 0), ("total", 1)]
                .into_iter()
                .map(|(name, kind)| {
                    let adapter = Arc::clone(&adapter);
                    let schema = schema.clone();
                    let key = key.clone();
                    std::thread::spawn(move || {
                        for i in 1..=5i64 {
                            let value = if kind == 0 {
                                Value::from(format!("s{i}"))
                            } else {
                                Value::from(i)
                            };
                            let patch = Record::new().with(name, value);
                            adapter.update(&schema, &key, &patch, &Record::new()).unwrap();
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            let stored = adapter.client().peek("orders", key.document.as_ref().unwrap()).unwrap();
            assert_eq!(stored.get("status"), Some(&Value::from("s5")));
            assert_eq!(stored.get("total"), Some(&Value::from(5i64)));
        }
    }

    #[test]
    fn guarded_update_skips_tombstoned_documents() {
        let adapter = adapter();
        let schema = orders();
        let key = order_key("t1", "o2");
        let live = Record::new().with("deleted_at", Value::Null);
        adapter
            .update(&schema, &key, &Record::new().with("deleted_at", "2024-01-01"), &live)
            .unwrap();
        let err = adapter
            .update(&schema, &key, &Record::new().with("status", "reopened"), &live)
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
        let stored = adapter.client().peek("orders", key.document.as_ref().unwrap()).unwrap();
        assert_eq!(stored.get("status"), Some(&Value::from("closed")));
    }

    #[test]
    fn delete_requires_hard_and_existing_document() {
        let adapter = adapter();
        let schema = orders();
        let key = RecordKey {
            id: "o2".into(),
            document: Some(DocumentKey {
                partition: Value::from("t1"),
                row: Value::from("o2"),
            }),
        };
        assert!(matches!(
            adapter.delete(&schema, &key, false),
            Err(CoreError::InvalidOperation { .. })
        ));
        adapter.delete(&schema, &key, true).unwrap();
        assert!(matches!(
            adapter.delete(&schema, &key, true),
            Err(CoreError::NotFound { .. })
        ));
        assert_eq!(adapter.client().len("orders"), 3);
    }

    #[test]
    fn grouped_count_counts_groups() {
        let adapter = adapter();
        let spec = QuerySpec::new().eq("tenant_id", "t1").group_by(["status"]);
        assert_eq!(adapter.count(&orders(), &spec, &CancelToken::new()).unwrap(), 2);
    }

    #[test]
    fn injected_failure_is_retryable() {
        let adapter = adapter();
        adapter.client().fail_next(1);
        let err = adapter
            .read(&orders(), &QuerySpec::new().eq("tenant_id", "t1"), &CancelToken::new())
            .unwrap_err();
        assert!(err.is_transient() && !err.may_have_applied());
    }
}
