//! Adapter for partitioned document stores.

use super::{
    acquire, reject_soft_delete, satisfies, write_race, BackendAdapter, DocumentKey, QueryOutput,
    RecordKey, UpdateOutcome, MAX_WRITE_RACES,
};
use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::query::{evaluate_predicate, keyset_after, shape_rows, QuerySpec, ShapeOptions};
use crate::record::{field, Record};
use crate::schema::{ModelSchema, StorageFamily};
use crate::translate::{translate_document, DocumentQuery, KeyScope};
use polystore_storage::{PermitPool, PoolConfig};
use std::sync::Arc;

const FILTER_CHECK_INTERVAL: usize = 256;

/// A document with the entity tag of its stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Document body.
    pub document: Record,
    /// Changes whenever the stored document does.
    pub etag: String,
}

/// Result of a conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The document was replaced.
    Replaced,
    /// No document has this key.
    Missing,
    /// The stored document no longer carries the expected etag.
    Stale,
}

/// Vendor client boundary for document stores.
///
/// Documents are addressed by [`DocumentKey`]. Only key-scoped scans are
/// required; everything else is evaluated by the adapter. Replaces are
/// conditional on an etag, as with `If-Match` on most document APIs.
pub trait DocumentClient: Send + Sync {
    /// Fetches one document with its etag.
    ///
    /// # Errors
    ///
    /// Transport failures as `Connection`.
    fn get(&self, collection: &str, key: &DocumentKey) -> CoreResult<Option<StoredDocument>>;

    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// `Conflict` if a document already has this key.
    fn insert(&self, collection: &str, key: &DocumentKey, document: &Record) -> CoreResult<()>;

    /// Replaces an existing document if its etag is still `if_match`.
    ///
    /// # Errors
    ///
    /// Transport failures as `Connection`.
    fn replace(
        &self,
        collection: &str,
        key: &DocumentKey,
        document: &Record,
        if_match: &str,
    ) -> CoreResult<ReplaceOutcome>;

    /// Removes a document. Returns false if none exists.
    ///
    /// # Errors
    ///
    /// Transport failures as `Connection`.
    fn remove(&self, collection: &str, key: &DocumentKey) -> CoreResult<bool>;

    /// Returns every document in `scope`.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the token fires mid-scan.
    fn scan(&self, collection: &str, scope: &KeyScope, cancel: &CancelToken) -> CoreResult<Vec<Record>>;
}

impl<C: DocumentClient + ?Sized> DocumentClient for Arc<C> {
    fn get(&self, collection: &str, key: &DocumentKey) -> CoreResult<Option<StoredDocument>> {
        (**self).get(collection, key)
    }

    fn insert(&self, collection: &str, key: &DocumentKey, document: &Record) -> CoreResult<()> {
        (**self).insert(collection, key, document)
    }

    fn replace(
        &self,
        collection: &str,
        key: &DocumentKey,
        document: &Record,
        if_match: &str,
    ) -> CoreResult<ReplaceOutcome> {
        (**self).replace(collection, key, document, if_match)
    }

    fn remove(&self, collection: &str, key: &DocumentKey) -> CoreResult<bool> {
        (**self).remove(collection, key)
    }

    fn scan(&self, collection: &str, scope: &KeyScope, cancel: &CancelToken) -> CoreResult<Vec<Record>> {
        (**self).scan(collection, scope, cancel)
    }
}

/// [`BackendAdapter`] over a [`DocumentClient`].
#[derive(Debug)]
pub struct DocumentAdapter<C> {
    name: String,
    client: C,
    pool: PermitPool,
}

impl<C: DocumentClient> DocumentAdapter<C> {
    /// Creates an adapter named `name` with its own permit pool.
    pub fn new(name: impl Into<String>, client: C, pool: PoolConfig) -> Self {
        Self {
            name: name.into(),
            client,
            pool: PermitPool::new(pool),
        }
    }

    /// The wrapped client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The permit pool.
    pub fn pool(&self) -> &PermitPool {
        &self.pool
    }

    /// Scans, post-filters and applies the keyset bound.
    fn matching(
        &self,
        schema: &ModelSchema,
        spec: &QuerySpec,
        query: &DocumentQuery,
        cancel: &CancelToken,
    ) -> CoreResult<Vec<Record>> {
        let scanned = {
            let _permit = acquire(&self.pool, &self.name)?;
            cancel.check("document scan")?;
            self.client
                .scan(&schema.table, &query.scope, cancel)
                .map_err(|err| err.for_model(&schema.name))?
        };
        let mut rows = Vec::with_capacity(scanned.len());
        for (i, doc) in scanned.into_iter().enumerate() {
            if i % FILTER_CHECK_INTERVAL == 0 {
                cancel.check("document filter")?;
            }
            let keep = query.post_filters.iter().all(|p| evaluate_predicate(&doc, p))
                && spec.keyset().map_or(true, |bound| keyset_after(&doc, bound));
            if keep {
                rows.push(doc);
            }
        }
        Ok(rows)
    }

    fn document_key<'k>(schema: &ModelSchema, key: &'k RecordKey) -> CoreResult<&'k DocumentKey> {
        key.document
            .as_ref()
            .ok_or_else(|| CoreError::validation(&schema.name, "document models need a partition and row key"))
    }
}

impl<C: DocumentClient> BackendAdapter for DocumentAdapter<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> StorageFamily {
        StorageFamily::Document
    }

    fn create(&self, schema: &ModelSchema, record: &Record) -> CoreResult<Record> {
        let key = RecordKey::of(schema, record)?;
        let doc_key = Self::document_key(schema, &key)?;
        if doc_key.partition.is_null() || doc_key.row.is_null() {
            return Err(CoreError::validation(
                &schema.name,
                format!(
                    "key fields {} and {} must be set",
                    schema.partition_key, schema.row_key
                ),
            ));
        }
        let _permit = acquire(&self.pool, &self.name)?;
        self.client
            .insert(&schema.table, doc_key, record)
            .map_err(|err| err.for_model(&schema.name))?;
        tracing::debug!(backend = %self.name, model = %schema.name, id = %key.id, "document inserted");
        Ok(record.clone())
    }

    fn read(
        &self,
        schema: &ModelSchema,
        spec: &QuerySpec,
        cancel: &CancelToken,
    ) -> CoreResult<QueryOutput> {
        let query = translate_document(spec, schema)?;
        if query.emulation.any() {
            tracing::debug!(model = %schema.name, emulation = ?query.emulation, "shaping document results in process");
        }
        for warning in &query.warnings {
            tracing::warn!(model = %schema.name, %warning, "document query warning");
        }
        let rows = self.matching(schema, spec, &query, cancel)?;
        Ok(QueryOutput {
            records: shape_rows(rows, &ShapeOptions::from_spec(spec)),
            warnings: query.warnings,
        })
    }

    fn update(
        &self,
        schema: &ModelSchema,
        key: &RecordKey,
        patch: &Record,
        guard: &Record,
    ) -> CoreResult<UpdateOutcome> {
        let doc_key = Self::document_key(schema, key)?;
        let _permit = acquire(&self.pool, &self.name)?;
        for attempt in 0..MAX_WRITE_RACES {
            let StoredDocument {
                document: current,
                etag,
            } = self
                .client
                .get(&schema.table, doc_key)
                .map_err(|err| err.for_model(&schema.name))?
                .filter(|stored| satisfies(&stored.document, guard))
                .ok_or_else(|| CoreError::not_found(&schema.name, &key.id))?;

            let mut changes = current.diff(patch);
            changes.remove(field::ID);
            for key_field in [&schema.partition_key, &schema.row_key] {
                if changes.contains_key(key_field.as_str()) {
                    return Err(CoreError::validation(
                        &schema.name,
                        format!("key field {key_field} cannot change"),
                    ));
                }
            }
            if changes.is_empty() {
                return Ok(UpdateOutcome {
                    record: current,
                    changes,
                });
            }

            let mut record = current;
            for (name, change) in &changes {
                record.set(name.clone(), change.new.clone());
            }
            let outcome = self
                .client
                .replace(&schema.table, doc_key, &record, &etag)
                .map_err(|err| err.for_model(&schema.name))?;
            match outcome {
                ReplaceOutcome::Replaced => {
                    tracing::debug!(backend = %self.name, model = %schema.name, id = %key.id, fields = changes.len(), "document replaced");
                    return Ok(UpdateOutcome { record, changes });
                }
                ReplaceOutcome::Missing => return Err(CoreError::not_found(&schema.name, &key.id)),
                ReplaceOutcome::Stale => {
                    tracing::debug!(backend = %self.name, model = %schema.name, id = %key.id, attempt, "document changed under update; re-reading");
                }
            }
        }
        Err(write_race(schema, &key.id))
    }

    fn delete(&self, schema: &ModelSchema, key: &RecordKey, hard: bool) -> CoreResult<()> {
        reject_soft_delete(hard)?;
        let doc_key = Self::document_key(schema, key)?;
        let _permit = acquire(&self.pool, &self.name)?;
        let removed = self
            .client
            .remove(&schema.table, doc_key)
            .map_err(|err| err.for_model(&schema.name))?;
        if removed {
            Ok(())
        } else {
            Err(CoreError::not_found(&schema.name, &key.id))
        }
    }

    fn count(&self, schema: &ModelSchema, spec: &QuerySpec, cancel: &CancelToken) -> CoreResult<u64> {
        let query = translate_document(spec, schema)?;
        let rows = self.matching(schema, spec, &query, cancel)?;
        let options = ShapeOptions {
            order: &[],
            skip: None,
            take: None,
            ..ShapeOptions::from_spec(spec)
        };
        Ok(shape_rows(rows, &options).len() as u64)
    }
}
