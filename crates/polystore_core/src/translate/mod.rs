//! Query translation: backend-neutral specs to native queries.
//!
//! Translation is pure and deterministic. Every field reference is checked
//! against the schema here, so an unknown field fails before any backend
//! is contacted.

pub mod document;
pub mod sql;

use crate::error::{CoreError, CoreResult};
use crate::query::{Distinct, Operator, QuerySpec, COUNT_COLUMN};
use crate::schema::ModelSchema;
use polystore_codec::Value;

pub use document::{translate_document, DocumentQuery, Emulation, KeyScope, QueryWarning};
pub use sql::{
    translate_count, translate_select, CompareOp, RenderedSql, SqlDelete, SqlDistinct, SqlExpr,
    SqlInsert, SqlSelect, SqlStatement, SqlUpdate,
};

/// Checks every field reference and operand shape in `spec`.
///
/// # Errors
///
/// Returns `InvalidQuery` naming the first offending field or operand.
pub fn validate_spec(spec: &QuerySpec, schema: &ModelSchema) -> CoreResult<()> {
    let fail = |message: String| Err(CoreError::invalid_query(&schema.name, message));
    let known = |name: &str| schema.is_known_field(name);
    let grouped = !spec.grouping().is_empty();
    let group_output = |name: &str| name == COUNT_COLUMN || spec.grouping().iter().any(|g| g == name);

    let sealed = |name: &str| schema.is_encrypted(name);

    for predicate in spec.predicates() {
        if !known(&predicate.field) {
            return fail(format!("unknown field {} in filter", predicate.field));
        }
        let null_test = matches!(predicate.op, Operator::Eq | Operator::Ne) && predicate.value.is_null();
        if sealed(&predicate.field) && !null_test {
            return fail(format!(
                "encrypted field {} can only be tested for null",
                predicate.field
            ));
        }
        let operand = &predicate.value;
        match predicate.op {
            Operator::In | Operator::NotIn if operand.as_array().is_none() => {
                return fail(format!(
                    "{} on {} needs an array operand, got {}",
                    predicate.op.as_str(),
                    predicate.field,
                    operand.kind_name()
                ));
            }
            Operator::Contains | Operator::StartsWith | Operator::EndsWith
                if operand.as_text().is_none() =>
            {
                return fail(format!(
                    "{} on {} needs a text operand, got {}",
                    predicate.op.as_str(),
                    predicate.field,
                    operand.kind_name()
                ));
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte
                if matches!(operand, Value::Null | Value::Array(_) | Value::Map(_)) =>
            {
                return fail(format!(
                    "{} on {} cannot compare against {}",
                    predicate.op.as_str(),
                    predicate.field,
                    operand.kind_name()
                ));
            }
            _ => {}
        }
    }

    for field in spec.grouping() {
        if !known(field) {
            return fail(format!("unknown field {field} in group by"));
        }
        if sealed(field) {
            return fail(format!("cannot group by encrypted field {field}"));
        }
    }
    for order in spec.order() {
        let ok = if grouped {
            group_output(&order.field)
        } else {
            known(&order.field)
        };
        if !ok || sealed(&order.field) {
            return fail(format!("cannot order by {}", order.field));
        }
    }
    if let Some(projection) = spec.projection() {
        if projection.is_empty() {
            return fail("projection is empty".into());
        }
        for field in projection {
            let ok = if grouped { group_output(field) } else { known(field) };
            if !ok {
                return fail(format!("cannot select {field}"));
            }
        }
        if *spec.distinct_mode() == Distinct::All && projection.iter().any(|f| sealed(f)) {
            return fail("distinct rows cannot compare encrypted fields".into());
        }
    }
    if let Distinct::On(fields) = spec.distinct_mode() {
        if fields.is_empty() {
            return fail("distinct on needs at least one field".into());
        }
        for field in fields {
            let ok = if grouped { group_output(field) } else { known(field) };
            if !ok {
                return fail(format!("unknown field {field} in distinct on"));
            }
            if sealed(field) {
                return fail(format!("cannot distinct on encrypted field {field}"));
            }
        }
    }
    if let Some(bound) = spec.keyset() {
        if bound.order.len() != bound.values.len() || bound.order != spec.order() {
            return fail("keyset bound does not match ordering".into());
        }
    }
    Ok(())
}
