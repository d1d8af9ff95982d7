use polystore_codec::{encode_canonical, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Column name of the aggregate produced by grouped queries.
pub const COUNT_COLUMN: &str = "count";

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Equal. Against null, matches missing or null fields.
    Eq,
    /// Not equal. Against null, matches present non-null fields.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Member of an array of values.
    In,
    /// Not a member of an array of values.
    NotIn,
    /// Text contains the literal substring.
    Contains,
    /// Text starts with the literal prefix.
    StartsWith,
    /// Text ends with the literal suffix.
    EndsWith,
}

impl Operator {
    /// Stable name used in fingerprints and messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
        }
    }
}

/// One `(field, operator, value)` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Field name.
    pub field: String,
    /// Operator.
    pub op: Operator,
    /// Operand. An array for `In`/`NotIn`, text for pattern operators.
    pub value: Value,
}

impl Predicate {
    /// Creates a predicate.
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.field.as_str()),
            Value::from(self.op.as_str()),
            self.value.clone(),
        ])
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ascending, nulls first.
    Asc,
    /// Descending, nulls last.
    Desc,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    /// Field name.
    pub field: String,
    /// Direction.
    pub direction: Direction,
}

impl OrderBy {
    /// Ascending on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    /// Descending on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.field.as_str()),
            Value::from(match self.direction {
                Direction::Asc => "asc",
                Direction::Desc => "desc",
            }),
        ])
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Asc => write!(f, "{} asc", self.field),
            Direction::Desc => write!(f, "{} desc", self.field),
        }
    }
}

/// Duplicate elimination mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Distinct {
    /// Keep duplicates.
    #[default]
    None,
    /// Drop rows whose selected columns equal an earlier row's.
    All,
    /// Keep the first row (in result order) per combination of these fields.
    On(Vec<String>),
}

/// Lower keyset bound: only rows sorting strictly after `values` under
/// `order` qualify. Produced by continuation tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetBound {
    /// Ordering the bound refers to.
    pub order: Vec<OrderBy>,
    /// Sort-key values of the last row already returned.
    pub values: Vec<Value>,
}

/// A backend-neutral query.
///
/// Builder methods consume and return the spec, so a spec shared elsewhere
/// is never mutated behind its owner's back.
///
/// ```rust
/// use polystore_core::query::{Operator, OrderBy, QuerySpec};
///
/// let spec = QuerySpec::new()
///     .eq("status", "active")
///     .filter("age", Operator::Gte, 18i64)
///     .order_by(OrderBy::desc("created_at"))
///     .take(20);
/// assert_eq!(spec.predicates().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuerySpec {
    predicates: Vec<Predicate>,
    order: Vec<OrderBy>,
    projection: Option<Vec<String>>,
    group_by: Vec<String>,
    skip: Option<u64>,
    take: Option<u64>,
    distinct: Distinct,
    after: Option<KeysetBound>,
}

impl QuerySpec {
    /// An empty spec: matches everything in scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::new(field, op, value));
        self
    }

    /// Adds an equality predicate.
    #[must_use]
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Operator::Eq, value)
    }

    /// Adds a prebuilt predicate.
    #[must_use]
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Appends an ordering key.
    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    /// Restricts returned fields.
    #[must_use]
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Groups by fields; rows become one per group plus a `count` column.
    #[must_use]
    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Skips the first `n` rows.
    #[must_use]
    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    /// Returns at most `n` rows.
    #[must_use]
    pub fn take(mut self, n: u64) -> Self {
        self.take = Some(n);
        self
    }

    /// Drops duplicate rows.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = Distinct::All;
        self
    }

    /// Keeps the first row per combination of `fields`.
    #[must_use]
    pub fn distinct_on<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distinct = Distinct::On(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub(crate) fn after(mut self, bound: KeysetBound) -> Self {
        self.after = Some(bound);
        self
    }

    #[must_use]
    pub(crate) fn with_order(mut self, order: Vec<OrderBy>) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub(crate) fn with_projection(mut self, projection: Option<Vec<String>>) -> Self {
        self.projection = projection;
        self
    }

    /// Predicates in insertion order.
    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Ordering keys.
    #[must_use]
    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    /// Projection, if any.
    #[must_use]
    pub fn projection(&self) -> Option<&[String]> {
        self.projection.as_deref()
    }

    /// Group-by fields.
    #[must_use]
    pub fn grouping(&self) -> &[String] {
        &self.group_by
    }

    /// Rows to skip.
    #[must_use]
    pub fn skip_count(&self) -> Option<u64> {
        self.skip
    }

    /// Row limit.
    #[must_use]
    pub fn take_count(&self) -> Option<u64> {
        self.take
    }

    /// Duplicate elimination mode.
    #[must_use]
    pub fn distinct_mode(&self) -> &Distinct {
        &self.distinct
    }

    /// Keyset bound, if this spec continues a page.
    #[must_use]
    pub fn keyset(&self) -> Option<&KeysetBound> {
        self.after.as_ref()
    }

    /// Whether rows are limited or offset.
    #[must_use]
    pub fn is_paged(&self) -> bool {
        self.skip.is_some() || self.take.is_some() || self.after.is_some()
    }

    /// Canonical form used for fingerprinting.
    ///
    /// Predicates are a conjunction, so their order is irrelevant and they
    /// are sorted. Ordering keys are kept in sequence.
    #[must_use]
    pub fn normalized(&self) -> Value {
        let mut predicates: Vec<Value> = self.predicates.iter().map(Predicate::to_value).collect();
        predicates.sort_by(Value::cmp_canonical);
        predicates.dedup();

        let distinct = match &self.distinct {
            Distinct::None => Value::Null,
            Distinct::All => Value::Bool(true),
            Distinct::On(fields) => Value::from(fields.clone()),
        };
        let after = self.after.as_ref().map_or(Value::Null, |b| {
            Value::Array(vec![
                Value::Array(b.order.iter().map(OrderBy::to_value).collect()),
                Value::Array(b.values.clone()),
            ])
        });
        let u64_value = |n: Option<u64>| n.map_or(Value::Null, |n| Value::Integer(i64::try_from(n).unwrap_or(i64::MAX)));

        Value::text_map([
            ("where", Value::Array(predicates)),
            ("order", Value::Array(self.order.iter().map(OrderBy::to_value).collect())),
            ("select", self.projection.clone().map_or(Value::Null, Value::from)),
            ("group", Value::from(self.group_by.clone())),
            ("skip", u64_value(self.skip)),
            ("take", u64_value(self.take)),
            ("distinct", distinct),
            ("after", after),
        ])
    }

    /// Deterministic hex SHA-256 of [`QuerySpec::normalized`].
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex_digest(&encode_canonical(&self.normalized()))
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
