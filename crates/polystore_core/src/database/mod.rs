//! Database facade.
//!
//! `Database` composes the adapters, overflow manager, cache layer and
//! audit chain, and enforces the invariants every caller relies on:
//!
//! - tenant id is injected into every write and into every read's filter
//!   set, unless the request carries an administrative bypass
//! - soft-deleted records are invisible unless `include_deleted` is asked for
//! - updates write, and audit, only fields whose value actually changed
//! - paged reads continue from a keyset token, never from an offset
//!
//! After a write commits, its audit entry is appended and then the
//! model's cache entries for the tenant are invalidated. Invalidation
//! runs even when the append fails. A failed append does not roll the
//! write back; the caller receives [`CoreError::AuditWrite`] carrying
//! the committed record.
//!
//! Writes to one record are serialized within the process from the read
//! that precedes them until their audit entry is appended, and adapters
//! make every update conditional on the state it was diffed against.
//! Concurrent writers therefore never lose each other's fields, and a
//! record's audit entries form a linear history.
//!
//! Fields declared encrypted are sealed before overflow handling and
//! opened after overflow restore, so backends, blob store, cache and
//! audit trail only ever hold ciphertext for them.
//!
//! ```rust,ignore
//! use polystore_core::{Config, Database, ReadOptions, Record, RequestContext, QuerySpec};
//!
//! let db = Database::builder(Config::default(), registry)
//!     .relational("sql", MemorySqlClient::new())
//!     .build()?;
//! let ctx = RequestContext::new("t1", "alice");
//!
//! let user = db.create(&ctx, "User", Record::new().with("name", "Ann"))?;
//! let page = db.read_page(&ctx, "User", QuerySpec::new(), 50, None)?;
//! ```

mod batch;
mod builder;
mod gate;
mod page;
mod upsert;

pub use batch::{BatchFailure, BatchOptions, BatchResult, DEFAULT_CHUNK_SIZE};
pub use builder::DatabaseBuilder;
pub use page::Page;

use crate::adapter::{BackendAdapter, QueryOutput, RecordKey};
use crate::audit::{AuditAction, AuditChain, AuditEntry, AuditEvent, ChainDivergence};
use crate::cache::{CacheKind, CacheLayer, CacheLookup, CacheTicket, Cached};
use crate::cancel::CancelToken;
use crate::clock::{record_timestamp, Clock};
use crate::config::Config;
use crate::context::RequestContext;
use crate::crypto::FieldEncryption;
use crate::error::{CoreError, CoreResult};
use crate::overflow::OverflowManager;
use crate::query::{Distinct, KeysetBound, QuerySpec};
use crate::record::{field, FieldChange, FieldChanges, Record};
use crate::retry::{Idempotency, RetryPolicy};
use crate::schema::{ModelSchema, SchemaRegistry};
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::translate::validate_spec;
use gate::WriteGate;
use page::{decode_token, encode_token, order_signature, sort_key, unique_order};
use polystore_codec::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Skip the result cache for this read (neither consulted nor filled).
    pub no_cache: bool,
    /// Include soft-deleted records.
    pub include_deleted: bool,
    /// Cancels the backend call when fired.
    pub cancel: CancelToken,
}

impl ReadOptions {
    /// Cached, live records only, not cancellable from outside.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bypasses the cache.
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Includes soft-deleted records.
    #[must_use]
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }
}

/// When a write invalidates the model's cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalidation {
    /// Right after the audit append, whether or not it succeeded.
    Now,
    /// Once per chunk, by the bulk driver.
    Deferred,
}

/// The multi-backend database handle.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct Database {
    config: Config,
    registry: SchemaRegistry,
    /// Model name to the adapter serving it.
    routes: HashMap<String, Arc<dyn BackendAdapter>>,
    overflow: OverflowManager,
    cache: CacheLayer,
    retry: RetryPolicy,
    /// `None` when auditing is disabled.
    audit: Option<AuditChain>,
    /// `None` unless a key was configured.
    encryption: Option<FieldEncryption>,
    gate: WriteGate,
    clock: Arc<dyn Clock>,
    stats: Arc<DatabaseStats>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("models", &self.registry.len())
            .field("audit", &self.audit.is_some())
            .field("encryption", &self.encryption.is_some())
            .finish_non_exhaustive()
    }
}

/// Rejects writes to fields the database manages. A caller may choose
/// the id of a new record.
fn check_user_fields(schema: &ModelSchema, fields: &Record, creating: bool) -> CoreResult<()> {
    for (name, value) in fields.iter() {
        if !field::is_implicit(name) {
            continue;
        }
        if creating && name == field::ID && value.as_text().is_some_and(|id| !id.is_empty()) {
            continue;
        }
        return Err(CoreError::validation(
            &schema.name,
            format!("field {name} is managed by the database"),
        ));
    }
    Ok(())
}

/// Widens a projection that selects encrypted fields so rows carry the
/// tenant and id their ciphertext is bound to. Returns the caller's
/// projection to cut back to, if widened.
fn openable_projection(schema: &ModelSchema, spec: QuerySpec) -> (QuerySpec, Option<Vec<String>>) {
    let Some(projection) = spec.projection() else {
        return (spec, None);
    };
    if !spec.grouping().is_empty() || !projection.iter().any(|name| schema.is_encrypted(name)) {
        return (spec, None);
    }
    let requested = projection.to_vec();
    let mut widened = requested.clone();
    for name in [field::ID, field::TENANT_ID] {
        if !widened.iter().any(|n| n == name) {
            widened.push(name.to_string());
        }
    }
    if widened.len() == requested.len() {
        return (spec, None);
    }
    (spec.with_projection(Some(widened)), Some(requested))
}

impl Database {
    /// Starts building a database over `registry`.
    #[must_use]
    pub fn builder(config: Config, registry: SchemaRegistry) -> DatabaseBuilder {
        DatabaseBuilder::new(config, registry)
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registered models.
    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Point-in-time operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn route(&self, model: &str) -> CoreResult<(Arc<ModelSchema>, &Arc<dyn BackendAdapter>)> {
        let schema = self.registry.get(model)?;
        let adapter = self
            .routes
            .get(model)
            .ok_or_else(|| CoreError::ModelNotRegistered {
                name: model.to_string(),
            })?;
        Ok((schema, adapter))
    }

    fn observe<T>(&self, op: &str, model: &str, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(err) = &result {
            self.stats.record_error();
            tracing::debug!(op, model, error = %err, "operation failed");
        }
        result
    }

    fn timestamp(&self) -> Value {
        Value::from(record_timestamp(self.clock.now()))
    }

    /// Adds tenant and soft-delete predicates.
    fn scoped(&self, ctx: &RequestContext, spec: QuerySpec, include_deleted: bool) -> CoreResult<QuerySpec> {
        let mut spec = spec;
        if !ctx.admin_bypass {
            spec = spec.eq(field::TENANT_ID, ctx.require_tenant()?);
        }
        if self.config.soft_delete_enabled && !include_deleted {
            spec = spec.eq(field::DELETED_AT, Value::Null);
        }
        Ok(spec)
    }

    /// Cached result, or the ticket to fill on a miss. Uncached models,
    /// `no_cache` reads and admin-bypass reads get neither.
    fn cache_ticket(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        kind: CacheKind,
        spec: &QuerySpec,
        options: &ReadOptions,
    ) -> Result<Cached, Option<CacheTicket>> {
        if !schema.cache.enabled || options.no_cache || ctx.admin_bypass {
            return Err(None);
        }
        match self.cache.lookup(&ctx.tenant_id, schema, kind, spec) {
            Ok(CacheLookup::Hit(cached)) => Ok(cached),
            Ok(CacheLookup::Miss(ticket)) => Err(Some(ticket)),
            Err(err) => {
                tracing::warn!(model = %schema.name, error = %err, "cache lookup failed; reading backend");
                Err(None)
            }
        }
    }

    fn fill_cache(&self, ticket: Option<CacheTicket>, result: &Cached) {
        if let Some(ticket) = ticket {
            if let Err(err) = self.cache.populate(ticket, result) {
                tracing::warn!(error = %err, "cache populate failed");
            }
        }
    }

    fn invalidate_quietly(&self, tenant: &str, model: &str) {
        if let Err(err) = self.cache.invalidate(tenant, model) {
            tracing::error!(tenant, model, error = %err, "cache invalidation failed after commit");
        }
    }

    /// Backend rows for an already scoped spec, through the cache.
    fn fetch(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        spec: &QuerySpec,
        options: &ReadOptions,
    ) -> CoreResult<QueryOutput> {
        let ticket = match self.cache_ticket(ctx, schema, CacheKind::Rows, spec, options) {
            Ok(Cached::Rows(output)) => return Ok(output),
            Ok(Cached::Count(_)) => None,
            Err(ticket) => ticket,
        };
        let output = self.retry.run("read", Idempotency::Idempotent, |_| {
            adapter.read(schema, spec, &options.cancel)
        })?;
        self.fill_cache(ticket, &Cached::Rows(output.clone()));
        Ok(output)
    }

    /// Seals encrypted fields of `record`, which belongs to record `id`.
    fn seal(&self, ctx: &RequestContext, schema: &ModelSchema, id: &str, record: Record) -> CoreResult<Record> {
        match &self.encryption {
            Some(encryption) => encryption.seal_record(schema, &ctx.tenant_id, id, record),
            None => Ok(record),
        }
    }

    /// A stored record as callers see it: overflow restored, then opened.
    fn reveal(&self, schema: &ModelSchema, record: Record) -> CoreResult<Record> {
        let record = self.overflow.restore(record)?;
        self.open(schema, record)
    }

    fn open(&self, schema: &ModelSchema, record: Record) -> CoreResult<Record> {
        match &self.encryption {
            Some(encryption) => encryption.open_record(schema, record),
            None => Ok(record),
        }
    }

    fn reveal_all(&self, schema: &ModelSchema, records: Vec<Record>) -> CoreResult<Vec<Record>> {
        records
            .into_iter()
            .map(|record| self.reveal(schema, record))
            .collect()
    }

    /// Stored values an update or soft delete requires to still hold.
    fn live_guard(&self, ctx: &RequestContext) -> Record {
        let guard = Record::new().with(field::TENANT_ID, ctx.tenant_id.as_str());
        if self.config.soft_delete_enabled {
            guard.with(field::DELETED_AT, Value::Null)
        } else {
            guard
        }
    }

    /// The stored (unrestored) record `id` in the caller's tenant.
    fn current(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        id: &str,
        include_deleted: bool,
    ) -> CoreResult<Record> {
        let mut spec = QuerySpec::new()
            .eq(field::ID, id)
            .eq(field::TENANT_ID, ctx.tenant_id.as_str());
        if self.config.soft_delete_enabled && !include_deleted {
            spec = spec.eq(field::DELETED_AT, Value::Null);
        }
        let cancel = CancelToken::new();
        let output = self.retry.run("lookup", Idempotency::Idempotent, |_| {
            adapter.read(schema, &spec, &cancel)
        })?;
        output
            .records
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::not_found(&schema.name, id))
    }

    /// Audit, then cache invalidation, for a committed write.
    fn after_commit(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        action: AuditAction,
        record: Record,
        changes: FieldChanges,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let result = match &self.audit {
            None => Ok(record),
            Some(audit) => self.append_audit(audit, ctx, schema, action, record, changes),
        };
        if invalidation == Invalidation::Now {
            self.invalidate_quietly(&ctx.tenant_id, &schema.name);
        }
        result
    }

    fn append_audit(
        &self,
        audit: &AuditChain,
        ctx: &RequestContext,
        schema: &ModelSchema,
        action: AuditAction,
        record: Record,
        changes: FieldChanges,
    ) -> CoreResult<Record> {
        let entity_id = record.id().unwrap_or_default().to_string();
        let event = AuditEvent {
            tenant_id: ctx.tenant_id.clone(),
            actor_id: ctx.actor_id.clone(),
            roles: ctx.roles.clone(),
            action,
            model: schema.name.clone(),
            entity_id: entity_id.clone(),
            changed_fields: changes,
            trace_id: ctx.trace_id.clone(),
            request_id: ctx.request_id.clone(),
        };
        match audit.append(event) {
            Ok(_) => Ok(record),
            Err(source) => {
                tracing::error!(
                    model = %schema.name,
                    id = %entity_id,
                    action = %action,
                    error = %source,
                    "mutation committed without audit entry"
                );
                Err(CoreError::AuditWrite {
                    model: schema.name.clone(),
                    entity_id,
                    record: Box::new(record),
                    source: Box::new(source),
                })
            }
        }
    }

    // --- writes ---------------------------------------------------------

    /// Creates a record.
    ///
    /// Identity, tenant and creation fields are injected; a caller may
    /// supply `id`. Encrypted fields are sealed, then large fields move
    /// to the blob store.
    ///
    /// # Errors
    ///
    /// `Validation` for bad fields, `Conflict` on a unique collision,
    /// `AuditWrite` if the record was stored but not audited.
    pub fn create(&self, ctx: &RequestContext, model: &str, fields: Record) -> CoreResult<Record> {
        let result = self.route(model).and_then(|(schema, adapter)| {
            self.create_one(
                ctx,
                &schema,
                adapter.as_ref(),
                fields,
                Idempotency::NonIdempotent,
                Invalidation::Now,
            )
        });
        self.observe("create", model, result)
    }

    fn create_one(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        fields: Record,
        idempotency: Idempotency,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let tenant = ctx.require_tenant()?;
        check_user_fields(schema, &fields, true)?;
        schema.validate_fields(&fields, true)?;

        let now = self.timestamp();
        let actor = Value::from(ctx.actor_id.as_str());
        let id = match fields.id() {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let mut record = self.seal(ctx, schema, &id, fields)?;
        record.set(field::ID, id.as_str());
        record.set(field::TENANT_ID, tenant);
        record.set(field::CREATED_AT, now.clone());
        record.set(field::CREATED_BY, actor.clone());
        record.set(field::UPDATED_AT, now);
        record.set(field::UPDATED_BY, actor);
        record.set(field::DELETED_AT, Value::Null);
        record.set(field::DELETED_BY, Value::Null);

        let changes: FieldChanges = record
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), FieldChange::new(Value::Null, value.clone())))
            .collect();
        let full = record.clone();
        let prepared = self.overflow.prepare(schema, record)?;
        let mut retried = false;
        let result = self.retry.run("create", idempotency, |attempt| {
            retried = attempt > 0;
            adapter.create(schema, &prepared.record)
        });
        let mut created = match result {
            // An earlier attempt may have landed before its connection failed.
            Err(err @ CoreError::Conflict { .. }) if retried => {
                match self.current(ctx, schema, adapter, &id, true) {
                    Ok(stored) if stored == prepared.record => {
                        tracing::debug!(model = %schema.name, id = %id, "create landed on an earlier attempt");
                        stored
                    }
                    _ => return Err(err),
                }
            }
            other => other?,
        };
        for (name, _) in &prepared.spilled {
            created.set(name.clone(), full.get_or_null(name).clone());
        }
        let created = self.open(schema, created)?;

        self.stats.record_create();
        tracing::debug!(
            model = %schema.name,
            tenant,
            id = %id,
            spilled = prepared.spilled.len(),
            "record created"
        );
        self.after_commit(ctx, schema, AuditAction::Create, created, changes, invalidation)
    }

    /// Applies `patch` to record `id`.
    ///
    /// Only fields whose value differs are written and audited. A patch
    /// that changes nothing performs no write and appends no audit entry.
    /// A concurrent write to other fields of the same record is kept.
    ///
    /// # Errors
    ///
    /// `NotFound` if the record is absent or soft-deleted, `Validation`
    /// for managed or mistyped fields, `AuditWrite` as for create.
    pub fn update(&self, ctx: &RequestContext, model: &str, id: &str, patch: Record) -> CoreResult<Record> {
        let result = self.route(model).and_then(|(schema, adapter)| {
            self.update_one(ctx, &schema, adapter.as_ref(), id, patch, Invalidation::Now)
        });
        self.observe("update", model, result)
    }

    fn update_one(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        id: &str,
        patch: Record,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let tenant = ctx.require_tenant()?;
        check_user_fields(schema, &patch, false)?;
        schema.validate_fields(&patch, false)?;

        let _gate = self.gate.lock(tenant, &schema.name, id);
        let current = self.current(ctx, schema, adapter, id, false)?;
        let guard = self.live_guard(ctx);
        self.apply_update(
            ctx,
            schema,
            adapter,
            current,
            patch,
            &guard,
            Idempotency::NonIdempotent,
            invalidation,
        )
    }

    /// Writes the fields of the plaintext `patch` that differ from the
    /// stored `current`, stamping the update fields. Caller holds the gate.
    #[allow(clippy::too_many_arguments)]
    fn apply_update(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        current: Record,
        patch: Record,
        guard: &Record,
        idempotency: Idempotency,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let id = current.id().unwrap_or_default().to_string();
        let unspilled = self.overflow.restore(current.clone())?;
        let plain = self.open(schema, unspilled.clone())?;
        let effective: Record = patch
            .iter()
            .filter(|(name, value)| plain.get_or_null(name) != *value)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if effective.is_empty() {
            tracing::debug!(model = %schema.name, id = %id, "update changes nothing");
            return Ok(plain);
        }

        // Only changed fields are resealed; the rest keep their ciphertext.
        let mut merged = unspilled;
        merged.merge(&self.seal(ctx, schema, &id, effective.clone())?);
        merged.set(field::UPDATED_AT, self.timestamp());
        merged.set(field::UPDATED_BY, ctx.actor_id.as_str());
        let full = merged.clone();
        let prepared = self.overflow.prepare(schema, merged)?;

        // Changed fields, plus anything re-spilled or un-spilled by the merge.
        let write: Record = prepared
            .record
            .iter()
            .filter(|(name, value)| {
                name.as_str() != field::ID
                    && (effective.contains(name.as_str())
                        || name.as_str() == field::UPDATED_AT
                        || name.as_str() == field::UPDATED_BY
                        || current.get_or_null(name.as_str()) != *value)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let key = RecordKey::of(schema, &current)?;
        let mut retried = false;
        let outcome = self.retry.run("update", idempotency, |attempt| {
            retried = attempt > 0;
            adapter.update(schema, &key, &write, guard)
        })?;
        let mut changes = outcome.changes;
        if changes.is_empty() && retried {
            // The write landed on an attempt whose reply was lost.
            changes = current.diff(&write);
        }
        let changes = self.overflow.resolve_changes(changes)?;

        let mut record = outcome.record;
        for (name, _) in &prepared.spilled {
            if record.get(name) == prepared.record.get(name) {
                record.set(name.clone(), full.get_or_null(name).clone());
            }
        }
        let record = self.reveal(schema, record)?;
        if changes.is_empty() {
            tracing::debug!(model = %schema.name, id = %id, "concurrent writer already applied the update");
            return Ok(record);
        }

        self.stats.record_update();
        tracing::debug!(model = %schema.name, id = %id, changed = changes.len(), "record updated");
        self.after_commit(ctx, schema, AuditAction::Update, record, changes, invalidation)
    }

    /// Deletes record `id`.
    ///
    /// A soft delete stamps `deleted_at`/`deleted_by`. With `hard`, or
    /// when soft delete is disabled, the record is removed and no read
    /// mode can see it again. A soft-deleted record can still be hard
    /// deleted.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent (or, for a soft delete, already deleted),
    /// `AuditWrite` as for create.
    pub fn delete(&self, ctx: &RequestContext, model: &str, id: &str, hard: bool) -> CoreResult<()> {
        let result = self.route(model).and_then(|(schema, adapter)| {
            self.delete_one(ctx, &schema, adapter.as_ref(), id, hard, Invalidation::Now)
        });
        self.observe("delete", model, result).map(|_| ())
    }

    fn delete_one(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        id: &str,
        hard: bool,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let tenant = ctx.require_tenant()?;
        let _gate = self.gate.lock(tenant, &schema.name, id);
        let soft = !hard && self.config.soft_delete_enabled;
        let current = self.current(ctx, schema, adapter, id, !soft)?;
        let key = RecordKey::of(schema, &current)?;
        let now = self.timestamp();
        let actor = Value::from(ctx.actor_id.as_str());

        let (record, changes) = if soft {
            let tombstone = Record::new()
                .with(field::DELETED_AT, now.clone())
                .with(field::DELETED_BY, actor.clone())
                .with(field::UPDATED_AT, now)
                .with(field::UPDATED_BY, actor);
            let guard = self.live_guard(ctx);
            let outcome = self.retry.run("delete", Idempotency::NonIdempotent, |_| {
                adapter.update(schema, &key, &tombstone, &guard)
            })?;
            (outcome.record, outcome.changes)
        } else {
            self.retry.run("delete", Idempotency::NonIdempotent, |_| {
                adapter.delete(schema, &key, true)
            })?;
            let mut changes = FieldChanges::new();
            changes.insert(
                field::DELETED_AT.to_string(),
                FieldChange::new(current.get_or_null(field::DELETED_AT).clone(), now.clone()),
            );
            changes.insert(
                field::DELETED_BY.to_string(),
                FieldChange::new(current.get_or_null(field::DELETED_BY).clone(), actor.clone()),
            );
            let mut removed = current;
            removed.set(field::DELETED_AT, now);
            removed.set(field::DELETED_BY, actor);
            (removed, changes)
        };

        self.stats.record_delete();
        tracing::debug!(model = %schema.name, id, hard = !soft, "record deleted");
        self.after_commit(ctx, schema, AuditAction::Delete, record, changes, invalidation)
    }

    // --- reads ----------------------------------------------------------

    /// Records matching `spec`.
    ///
    /// # Errors
    ///
    /// As for [`Database::query`].
    pub fn read(
        &self,
        ctx: &RequestContext,
        model: &str,
        spec: QuerySpec,
        options: &ReadOptions,
    ) -> CoreResult<Vec<Record>> {
        self.query(ctx, model, spec, options).map(|output| output.records)
    }

    /// Runs `spec`, returning records with any backend advisories.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for unknown fields, `Cancelled` if the token fires,
    /// `OverflowIntegrity` if a spilled field cannot be restored.
    pub fn query(
        &self,
        ctx: &RequestContext,
        model: &str,
        spec: QuerySpec,
        options: &ReadOptions,
    ) -> CoreResult<QueryOutput> {
        let result = self.route(model).and_then(|(schema, adapter)| {
            validate_spec(&spec, &schema)?;
            let (spec, requested) = openable_projection(&schema, spec);
            let spec = self.scoped(ctx, spec, options.include_deleted)?;
            self.stats.record_read();
            let mut output = self.fetch(ctx, &schema, adapter.as_ref(), &spec, options)?;
            output.records = self.reveal_all(&schema, output.records)?;
            if let Some(names) = requested {
                output.records = output.records.iter().map(|r| r.project(&names)).collect();
            }
            Ok(output)
        });
        self.observe("query", model, result)
    }

    /// The record with `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no visible record has this id.
    pub fn read_one(
        &self,
        ctx: &RequestContext,
        model: &str,
        id: &str,
        options: &ReadOptions,
    ) -> CoreResult<Record> {
        self.read(ctx, model, QuerySpec::new().eq(field::ID, id), options)?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::not_found(model, id))
    }

    /// Number of matching records (or groups, for a grouped spec).
    ///
    /// # Errors
    ///
    /// As for [`Database::query`].
    pub fn count(
        &self,
        ctx: &RequestContext,
        model: &str,
        spec: QuerySpec,
        options: &ReadOptions,
    ) -> CoreResult<u64> {
        let result = self.route(model).and_then(|(schema, adapter)| {
            validate_spec(&spec, &schema)?;
            let spec = self.scoped(ctx, spec, options.include_deleted)?;
            self.stats.record_read();
            let ticket = match self.cache_ticket(ctx, &schema, CacheKind::Count, &spec, options) {
                Ok(Cached::Count(n)) => return Ok(n),
                Ok(Cached::Rows(_)) => None,
                Err(ticket) => ticket,
            };
            let n = self.retry.run("count", Idempotency::Idempotent, |_| {
                adapter.count(&schema, &spec, &options.cancel)
            })?;
            self.fill_cache(ticket, &Cached::Count(n));
            Ok(n)
        });
        self.observe("count", model, result)
    }

    /// One page of live records, ordered by `spec`'s ordering made unique
    /// with `id`.
    ///
    /// Pass the previous page's `next_token` to continue. Records inserted
    /// between calls never cause rows to repeat or be skipped.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for a zero page size, a spec using skip/take,
    /// grouping or distinct, or a token issued for another ordering.
    pub fn read_page(
        &self,
        ctx: &RequestContext,
        model: &str,
        spec: QuerySpec,
        page_size: usize,
        token: Option<&str>,
    ) -> CoreResult<Page> {
        let result = self
            .route(model)
            .and_then(|(schema, adapter)| self.read_page_inner(ctx, &schema, adapter.as_ref(), spec, page_size, token));
        self.observe("read_page", model, result)
    }

    fn read_page_inner(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        spec: QuerySpec,
        page_size: usize,
        token: Option<&str>,
    ) -> CoreResult<Page> {
        let fail = |message: &str| Err(CoreError::invalid_query(&schema.name, message));
        if page_size == 0 {
            return fail("page size must be positive");
        }
        if spec.skip_count().is_some() || spec.take_count().is_some() {
            return fail("paged reads continue by token, not skip/take");
        }
        if !spec.grouping().is_empty() || *spec.distinct_mode() != Distinct::None {
            return fail("grouped or distinct reads cannot be paged");
        }
        validate_spec(&spec, schema)?;

        let order = unique_order(spec.order());
        let signature = order_signature(&schema.name, &order);
        let projection = spec.projection().map(<[String]>::to_vec);
        let limit = u64::try_from(page_size).unwrap_or(u64::MAX).saturating_add(1);
        let mut paged = spec
            .with_order(order.clone())
            .with_projection(None)
            .take(limit);
        if let Some(token) = token {
            let values = decode_token(&schema.name, token, &signature, order.len())?;
            paged = paged.after(KeysetBound {
                order: order.clone(),
                values,
            });
        }
        let paged = self.scoped(ctx, paged, false)?;

        self.stats.record_read();
        let output = self.fetch(ctx, schema, adapter, &paged, &ReadOptions::default())?;
        let mut records = output.records;
        let next_token = if records.len() > page_size {
            records.truncate(page_size);
            records
                .last()
                .map(|last| encode_token(&signature, sort_key(last, &order)))
        } else {
            None
        };
        let records = self
            .reveal_all(schema, records)?
            .into_iter()
            .map(|record| match &projection {
                Some(names) => record.project(names),
                None => record,
            })
            .collect();
        Ok(Page {
            records,
            next_token,
            warnings: output.warnings,
        })
    }

    // --- bulk -----------------------------------------------------------

    fn run_batch<I, T, F>(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        op: &str,
        items: Vec<I>,
        options: &BatchOptions,
        mut apply: F,
    ) -> BatchResult<T>
    where
        F: FnMut(I) -> CoreResult<T>,
    {
        let mut result = BatchResult::default();
        let chunk_size = options.chunk_size.max(1);
        let mut items = items.into_iter().enumerate().peekable();

        while items.peek().is_some() {
            let mut wrote = false;
            let mut stopped = false;
            for (index, item) in items.by_ref().take(chunk_size) {
                match apply(item) {
                    Ok(value) => {
                        wrote = true;
                        result.succeeded.push(value);
                    }
                    Err(error) => {
                        wrote |= matches!(error, CoreError::AuditWrite { .. });
                        self.stats.record_error();
                        tracing::debug!(op, model = %schema.name, index, error = %error, "batch item failed");
                        result.failures.push(BatchFailure { index, error });
                        if options.fail_fast {
                            stopped = true;
                            break;
                        }
                    }
                }
            }
            if wrote {
                self.invalidate_quietly(&ctx.tenant_id, &schema.name);
            }
            if stopped {
                result.skipped = items.by_ref().count();
                break;
            }
        }

        tracing::info!(
            op,
            model = %schema.name,
            succeeded = result.succeeded.len(),
            failed = result.failures.len(),
            skipped = result.skipped,
            "batch finished"
        );
        result
    }

    /// Creates each record, invalidating the cache once per chunk.
    ///
    /// # Errors
    ///
    /// Fails as a whole only for an unknown model or a missing tenant;
    /// per-item failures are reported in the result.
    pub fn bulk_create(
        &self,
        ctx: &RequestContext,
        model: &str,
        items: Vec<Record>,
        options: &BatchOptions,
    ) -> CoreResult<BatchResult<Record>> {
        let (schema, adapter) = self.route(model)?;
        ctx.require_tenant()?;
        Ok(self.run_batch(ctx, &schema, "bulk_create", items, options, |fields| {
            self.create_one(
                ctx,
                &schema,
                adapter.as_ref(),
                fields,
                Idempotency::NonIdempotent,
                Invalidation::Deferred,
            )
        }))
    }

    /// Applies each `(id, patch)`.
    ///
    /// # Errors
    ///
    /// As for [`Database::bulk_create`].
    pub fn bulk_update(
        &self,
        ctx: &RequestContext,
        model: &str,
        items: Vec<(String, Record)>,
        options: &BatchOptions,
    ) -> CoreResult<BatchResult<Record>> {
        let (schema, adapter) = self.route(model)?;
        ctx.require_tenant()?;
        Ok(self.run_batch(ctx, &schema, "bulk_update", items, options, |(id, patch)| {
            self.update_one(ctx, &schema, adapter.as_ref(), &id, patch, Invalidation::Deferred)
        }))
    }

    /// Deletes each id. Succeeded items are reported by id.
    ///
    /// # Errors
    ///
    /// As for [`Database::bulk_create`].
    pub fn bulk_delete(
        &self,
        ctx: &RequestContext,
        model: &str,
        ids: Vec<String>,
        hard: bool,
        options: &BatchOptions,
    ) -> CoreResult<BatchResult<String>> {
        let (schema, adapter) = self.route(model)?;
        ctx.require_tenant()?;
        Ok(self.run_batch(ctx, &schema, "bulk_delete", ids, options, |id| {
            self.delete_one(ctx, &schema, adapter.as_ref(), &id, hard, Invalidation::Deferred)
                .map(|_| id)
        }))
    }

    // --- cache and audit surface ----------------------------------------

    /// Drops the caller's tenant's cached results for `model`, for writers
    /// outside this process.
    ///
    /// # Errors
    ///
    /// `ModelNotRegistered`, `MissingTenant`, or a cache store failure.
    pub fn invalidate_cache(&self, ctx: &RequestContext, model: &str) -> CoreResult<()> {
        let schema = self.registry.get(model)?;
        let tenant = ctx.require_tenant()?;
        self.cache.invalidate(tenant, &schema.name)
    }

    /// Drops every cached result.
    ///
    /// # Errors
    ///
    /// Returns the cache store's error.
    pub fn clear_cache(&self) -> CoreResult<()> {
        self.cache.clear()
    }

    fn audit(&self) -> CoreResult<&AuditChain> {
        self.audit
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("auditing is disabled"))
    }

    /// First divergence in `tenant`'s audit chain, if any.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when auditing is disabled, or the store's error.
    pub fn verify_chain(&self, tenant: &str) -> CoreResult<Option<ChainDivergence>> {
        self.audit()?.verify_chain(tenant)
    }

    /// Like [`Database::verify_chain`], but a divergence is an error.
    ///
    /// # Errors
    ///
    /// `ChainDivergence` describing the first bad entry.
    pub fn ensure_chain_intact(&self, tenant: &str) -> CoreResult<()> {
        match self.verify_chain(tenant)? {
            Some(divergence) => Err(CoreError::ChainDivergence(divergence)),
            None => Ok(()),
        }
    }

    /// `tenant`'s audit entries with `from <= sequence_no < to`.
    ///
    /// # Errors
    ///
    /// As for [`Database::verify_chain`].
    pub fn audit_entries(&self, tenant: &str, from: u64, to: u64) -> CoreResult<Vec<AuditEntry>> {
        self.audit()?.entries(tenant, from, to)
    }
}
