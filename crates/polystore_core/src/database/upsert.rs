//! Create-or-update by caller-chosen id.

use super::{check_user_fields, BatchOptions, BatchResult, Database, Invalidation};
use crate::adapter::BackendAdapter;
use crate::context::RequestContext;
use crate::error::{CoreError, CoreResult};
use crate::record::{field, Record};
use crate::retry::Idempotency;
use crate::schema::ModelSchema;
use polystore_codec::Value;

impl Database {
    /// Stores `fields` under the id they carry, creating the record if no
    /// record in the caller's tenant has that id and updating it otherwise.
    ///
    /// An update writes and audits only the fields that differ, as
    /// [`Database::update`] does. A soft-deleted record is revived. With
    /// `replace`, declared and stored user fields missing from `fields`
    /// are cleared, and required fields must be present. The audit entry
    /// is a create or an update depending on which happened. Repeating an
    /// upsert leaves the same state, so transient failures are retried
    /// even when they may have applied.
    ///
    /// # Errors
    ///
    /// `Validation` if `fields` has no id or bad fields, `Conflict` if
    /// another record holds a unique value or the id belongs to another
    /// tenant, `AuditWrite` as for create.
    pub fn upsert(
        &self,
        ctx: &RequestContext,
        model: &str,
        fields: Record,
        replace: bool,
    ) -> CoreResult<Record> {
        let result = self.route(model).and_then(|(schema, adapter)| {
            self.upsert_one(ctx, &schema, adapter.as_ref(), fields, replace, Invalidation::Now)
        });
        self.observe("upsert", model, result)
    }

    /// Upserts each record, invalidating the cache once per chunk.
    ///
    /// # Errors
    ///
    /// As for [`Database::bulk_create`].
    pub fn bulk_upsert(
        &self,
        ctx: &RequestContext,
        model: &str,
        items: Vec<Record>,
        replace: bool,
        options: &BatchOptions,
    ) -> CoreResult<BatchResult<Record>> {
        let (schema, adapter) = self.route(model)?;
        ctx.require_tenant()?;
        Ok(self.run_batch(ctx, &schema, "bulk_upsert", items, options, |fields| {
            self.upsert_one(ctx, &schema, adapter.as_ref(), fields, replace, Invalidation::Deferred)
        }))
    }

    fn upsert_one(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        fields: Record,
        replace: bool,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let tenant = ctx.require_tenant()?;
        let id = fields
            .id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CoreError::validation(&schema.name, "upsert needs a non-empty text id"))?
            .to_string();
        check_user_fields(schema, &fields, true)?;

        let _gate = self.gate.lock(tenant, &schema.name, &id);
        match self.current(ctx, schema, adapter, &id, true) {
            Ok(current) => self.overwrite(ctx, schema, adapter, current, fields, replace, invalidation),
            Err(CoreError::NotFound { .. }) => {
                let created = self.create_one(
                    ctx,
                    schema,
                    adapter,
                    fields.clone(),
                    Idempotency::Idempotent,
                    invalidation,
                );
                match created {
                    // Another process created the record since the lookup.
                    Err(err @ CoreError::Conflict { .. }) => {
                        match self.current(ctx, schema, adapter, &id, true) {
                            Ok(current) => {
                                tracing::debug!(model = %schema.name, id = %id, "upsert lost a create race; updating");
                                self.overwrite(ctx, schema, adapter, current, fields, replace, invalidation)
                            }
                            Err(_) => Err(err),
                        }
                    }
                    other => other,
                }
            }
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn overwrite(
        &self,
        ctx: &RequestContext,
        schema: &ModelSchema,
        adapter: &dyn BackendAdapter,
        current: Record,
        fields: Record,
        replace: bool,
        invalidation: Invalidation,
    ) -> CoreResult<Record> {
        let mut patch = fields;
        patch.remove(field::ID);
        schema.validate_fields(&patch, replace)?;
        if replace {
            let absent: Vec<String> = schema
                .fields
                .iter()
                .map(|def| def.name.as_str())
                .chain(current.names().filter(|name| !field::is_implicit(name)))
                .filter(|name| !patch.contains(name))
                .map(str::to_string)
                .collect();
            for name in absent {
                patch.set(name, Value::Null);
            }
        }
        if current.is_deleted() {
            patch.set(field::DELETED_AT, Value::Null);
            patch.set(field::DELETED_BY, Value::Null);
        }

        let guard = Record::new().with(field::TENANT_ID, ctx.tenant_id.as_str());
        self.apply_update(
            ctx,
            schema,
            adapter,
            current,
            patch,
            &guard,
            Idempotency::Idempotent,
            invalidation,
        )
    }
}
