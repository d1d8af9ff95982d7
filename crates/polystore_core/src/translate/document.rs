//! Document target: key pushdown plus client-side emulation.
//!
//! Document stores address a record by (partition key, row key). Equality
//! predicates on those fields narrow the scan; every other predicate and
//! all shaping run in process after the scan.

use super::validate_spec;
use crate::error::CoreResult;
use crate::query::{Distinct, Operator, Predicate, QuerySpec};
use crate::schema::ModelSchema;
use polystore_codec::Value;
use std::fmt;

/// Which documents a scan must visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    /// A single document.
    Point {
        /// Partition key value.
        partition: Value,
        /// Row key value.
        row: Value,
    },
    /// Every document in one partition.
    Partition(Value),
    /// Documents with this row key in any partition.
    Row(Value),
    /// The whole collection.
    Full,
}

impl KeyScope {
    /// Returns true if a document with these keys is in scope.
    #[must_use]
    pub fn admits(&self, partition: &Value, row: &Value) -> bool {
        match self {
            KeyScope::Point { partition: p, row: r } => p == partition && r == row,
            KeyScope::Partition(p) => p == partition,
            KeyScope::Row(r) => r == row,
            KeyScope::Full => true,
        }
    }
}

/// Advisory surfaced alongside query results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryWarning {
    /// Paging was emulated over an ordering that is not unique, so pages
    /// may skip or repeat rows under concurrent writes.
    UnstablePagination {
        /// Model queried.
        model: String,
    },
    /// No key predicate narrowed the scan.
    FullScan {
        /// Model queried.
        model: String,
    },
}

impl QueryWarning {
    pub(crate) fn to_value(&self) -> Value {
        let (kind, model) = match self {
            QueryWarning::UnstablePagination { model } => ("unstable_pagination", model),
            QueryWarning::FullScan { model } => ("full_scan", model),
        };
        Value::text_map([("kind", kind), ("model", model.as_str())])
    }

    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        let model = value.get("model")?.as_text()?.to_string();
        match value.get("kind")?.as_text()? {
            "unstable_pagination" => Some(QueryWarning::UnstablePagination { model }),
            "full_scan" => Some(QueryWarning::FullScan { model }),
            _ => None,
        }
    }
}

impl fmt::Display for QueryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryWarning::UnstablePagination { model } => write!(
                f,
                "paging over {model} is emulated without a unique ordering; results may shift under concurrent writes"
            ),
            QueryWarning::FullScan { model } => {
                write!(f, "query on {model} has no key predicate and scans the collection")
            }
        }
    }
}

/// Shaping steps the adapter performs in process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Emulation {
    /// Sorting.
    pub order: bool,
    /// Skip, take or keyset bound.
    pub paging: bool,
    /// Grouping with counts.
    pub grouping: bool,
    /// Duplicate elimination.
    pub distinct: bool,
}

impl Emulation {
    /// Returns true if any step is emulated.
    #[must_use]
    pub fn any(&self) -> bool {
        self.order || self.paging || self.grouping || self.distinct
    }
}

/// A translated document query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    /// Documents the scan visits.
    pub scope: KeyScope,
    /// Predicates not consumed by the key scope.
    pub post_filters: Vec<Predicate>,
    /// Steps run client-side.
    pub emulation: Emulation,
    /// Advisories for the caller.
    pub warnings: Vec<QueryWarning>,
}

/// Index of the first equality predicate on `field` usable as a key.
fn key_predicate(predicates: &[Predicate], field: &str) -> Option<usize> {
    predicates.iter().position(|p| {
        p.field == field
            && p.op == Operator::Eq
            && matches!(p.value, Value::Text(_) | Value::Integer(_) | Value::Bytes(_))
    })
}

fn has_unique_ordering(spec: &QuerySpec, schema: &ModelSchema) -> bool {
    let ordered = |name: &str| spec.order().iter().any(|o| o.field == name);
    if !spec.grouping().is_empty() {
        return spec.grouping().iter().all(|g| ordered(g));
    }
    spec.order().iter().any(|o| schema.is_unique_field(&o.field))
        || (ordered(&schema.partition_key) && ordered(&schema.row_key))
}

/// Translates a spec for a document model.
///
/// # Errors
///
/// Returns `InvalidQuery` for unknown fields or malformed operands.
pub fn translate_document(spec: &QuerySpec, schema: &ModelSchema) -> CoreResult<DocumentQuery> {
    validate_spec(spec, schema)?;

    let mut post_filters = spec.predicates().to_vec();
    let partition = key_predicate(&post_filters, &schema.partition_key)
        .map(|i| post_filters.remove(i).value);
    let row = key_predicate(&post_filters, &schema.row_key).map(|i| post_filters.remove(i).value);

    let scope = match (partition, row) {
        (Some(partition), Some(row)) => KeyScope::Point { partition, row },
        (Some(partition), None) => KeyScope::Partition(partition),
        (None, Some(row)) => KeyScope::Row(row),
        (None, None) => KeyScope::Full,
    };

    let emulation = Emulation {
        order: !spec.order().is_empty(),
        paging: spec.is_paged(),
        grouping: !spec.grouping().is_empty(),
        distinct: *spec.distinct_mode() != Distinct::None,
    };

    let mut warnings = Vec::new();
    if scope == KeyScope::Full {
        warnings.push(QueryWarning::FullScan {
            model: schema.name.clone(),
        });
    }
    if emulation.paging && !has_unique_ordering(spec, schema) {
        warnings.push(QueryWarning::UnstablePagination {
            model: schema.name.clone(),
        });
    }

    Ok(DocumentQuery {
        scope,
        post_filters,
        emulation,
        warnings,
    })
}
