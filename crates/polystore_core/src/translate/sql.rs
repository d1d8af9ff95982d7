//! Relational target: a small SQL statement IR and its parameterized rendering.
//!
//! Values never appear in statement text. They travel as `$n` parameters
//! alongside it, and identifiers are double-quoted.

use super::validate_spec;
use crate::error::CoreResult;
use crate::query::{Direction, Distinct, KeysetBound, Operator, OrderBy, Predicate, QuerySpec, COUNT_COLUMN};
use crate::record::{field, Record};
use crate::schema::ModelSchema;
use polystore_codec::Value;
use std::fmt::Write as _;

/// Binary comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl CompareOp {
    fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }

    /// The equivalent neutral operator.
    #[must_use]
    pub fn operator(self) -> Operator {
        match self {
            CompareOp::Eq => Operator::Eq,
            CompareOp::Ne => Operator::Ne,
            CompareOp::Gt => Operator::Gt,
            CompareOp::Gte => Operator::Gte,
            CompareOp::Lt => Operator::Lt,
            CompareOp::Lte => Operator::Lte,
        }
    }
}

/// Boolean expression over one table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlExpr {
    /// `"column" <op> $n`
    Compare {
        /// Column.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Bound parameter.
        value: Value,
    },
    /// `"column" IS [NOT] NULL`
    IsNull {
        /// Column.
        column: String,
        /// `IS NOT NULL` when true.
        negated: bool,
    },
    /// `"column" [NOT] IN ($1, ...)`; never empty.
    InList {
        /// Column.
        column: String,
        /// Bound parameters.
        values: Vec<Value>,
        /// `NOT IN` when true.
        negated: bool,
    },
    /// `"column" LIKE $n ESCAPE '\'` with an already escaped pattern.
    Like {
        /// Column.
        column: String,
        /// Pattern with `%`, `_` and `\` in the literal part escaped.
        pattern: String,
    },
    /// Conjunction; empty is true.
    And(Vec<SqlExpr>),
    /// Disjunction; empty is false.
    Or(Vec<SqlExpr>),
    /// `TRUE` or `FALSE`.
    Literal(bool),
}

impl SqlExpr {
    /// `"column" = $n`, or `IS NULL` for a null value.
    pub fn equals(column: impl Into<String>, value: Value) -> Self {
        let column = column.into();
        if value.is_null() {
            SqlExpr::IsNull {
                column,
                negated: false,
            }
        } else {
            SqlExpr::Compare {
                column,
                op: CompareOp::Eq,
                value,
            }
        }
    }
}

/// `SELECT DISTINCT` mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SqlDistinct {
    /// Plain `SELECT`.
    #[default]
    None,
    /// `SELECT DISTINCT`.
    All,
    /// `SELECT DISTINCT ON (...)`.
    On(Vec<String>),
}

/// A `SELECT` over one table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SqlSelect {
    /// Table.
    pub table: String,
    /// Duplicate elimination.
    pub distinct: SqlDistinct,
    /// Selected columns; `None` selects `*` (or the group columns and count).
    pub columns: Option<Vec<String>>,
    /// `WHERE` clause.
    pub filter: Option<SqlExpr>,
    /// `GROUP BY` columns; adds `COUNT(*) AS "count"`.
    pub group_by: Vec<String>,
    /// `ORDER BY` keys.
    pub order_by: Vec<OrderBy>,
    /// `LIMIT`.
    pub limit: Option<u64>,
    /// `OFFSET`.
    pub offset: Option<u64>,
}

impl SqlSelect {
    /// `SELECT * FROM table WHERE "id" = $1`.
    pub fn by_id(table: impl Into<String>, id: &str) -> Self {
        Self {
            table: table.into(),
            filter: Some(SqlExpr::equals(field::ID, Value::from(id))),
            limit: Some(1),
            ..Self::default()
        }
    }
}

/// `INSERT ... RETURNING *`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlInsert {
    /// Table.
    pub table: String,
    /// Row to insert.
    pub row: Record,
}

/// `UPDATE ... RETURNING *`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlUpdate {
    /// Table.
    pub table: String,
    /// Column assignments.
    pub assignments: Vec<(String, Value)>,
    /// Rows to update.
    pub filter: SqlExpr,
}

/// `DELETE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlDelete {
    /// Table.
    pub table: String,
    /// Rows to delete.
    pub filter: SqlExpr,
}

/// A statement a [`crate::adapter::SqlClient`] executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlStatement {
    /// Returns rows.
    Select(SqlSelect),
    /// Returns the number of rows the inner select would produce.
    Count(SqlSelect),
    /// Returns the inserted row.
    Insert(SqlInsert),
    /// Returns updated rows.
    Update(SqlUpdate),
    /// Returns the number of deleted rows.
    Delete(SqlDelete),
}

/// Statement text plus positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSql {
    /// Text with `$1..$n` placeholders.
    pub text: String,
    /// Parameter values, `params[0]` binds `$1`.
    pub params: Vec<Value>,
}

/// Quotes an identifier, doubling embedded quotes.
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Escapes LIKE metacharacters so `literal` matches only itself.
#[must_use]
pub fn escape_like(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Default)]
struct Renderer {
    text: String,
    params: Vec<Value>,
}

impl Renderer {
    fn param(&mut self, value: &Value) {
        self.params.push(value.clone());
        let _ = write!(self.text, "${}", self.params.len());
    }

    fn push(&mut self, s: &str) {
        self.text.push_str(s);
    }

    fn expr(&mut self, expr: &SqlExpr) {
        match expr {
            SqlExpr::Compare { column, op, value } => {
                self.push(&quote(column));
                self.push(" ");
                self.push(op.sql());
                self.push(" ");
                self.param(value);
            }
            SqlExpr::IsNull { column, negated } => {
                self.push(&quote(column));
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            SqlExpr::InList {
                column,
                values,
                negated,
            } => {
                self.push(&quote(column));
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.param(value);
                }
                self.push(")");
            }
            SqlExpr::Like { column, pattern } => {
                self.push(&quote(column));
                self.push(" LIKE ");
                self.param(&Value::from(pattern.as_str()));
                self.push(" ESCAPE '\\'");
            }
            SqlExpr::And(items) => self.junction(items, " AND ", "TRUE"),
            SqlExpr::Or(items) => self.junction(items, " OR ", "FALSE"),
            SqlExpr::Literal(b) => self.push(if *b { "TRUE" } else { "FALSE" }),
        }
    }

    fn junction(&mut self, items: &[SqlExpr], joiner: &str, empty: &str) {
        if items.is_empty() {
            self.push(empty);
            return;
        }
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(joiner);
            }
            let nested = matches!(item, SqlExpr::And(_) | SqlExpr::Or(_));
            if nested {
                self.push("(");
            }
            self.expr(item);
            if nested {
                self.push(")");
            }
        }
    }

    fn column_list(&mut self, columns: &[String]) {
        let list: Vec<String> = columns
            .iter()
            .map(|c| {
                if c == COUNT_COLUMN {
                    format!("COUNT(*) AS {}", quote(COUNT_COLUMN))
                } else {
                    quote(c)
                }
            })
            .collect();
        self.push(&list.join(", "));
    }

    fn select(&mut self, select: &SqlSelect, with_paging: bool) {
        self.push("SELECT ");
        match &select.distinct {
            SqlDistinct::None => {}
            SqlDistinct::All => self.push("DISTINCT "),
            SqlDistinct::On(columns) => {
                let list: Vec<String> = columns.iter().map(|c| quote(c)).collect();
                self.push(&format!("DISTINCT ON ({}) ", list.join(", ")));
            }
        }
        match (&select.columns, select.group_by.is_empty()) {
            (Some(columns), _) => self.column_list(columns),
            (None, false) => {
                let mut columns = select.group_by.clone();
                columns.push(COUNT_COLUMN.to_string());
                self.column_list(&columns);
            }
            (None, true) => self.push("*"),
        }
        self.push(" FROM ");
        self.push(&quote(&select.table));
        if let Some(filter) = &select.filter {
            self.push(" WHERE ");
            self.expr(filter);
        }
        if !select.group_by.is_empty() {
            let list: Vec<String> = select.group_by.iter().map(|c| quote(c)).collect();
            self.push(&format!(" GROUP BY {}", list.join(", ")));
        }
        if !with_paging {
            return;
        }
        if !select.order_by.is_empty() {
            let list: Vec<String> = select
                .order_by
                .iter()
                .map(|o| match o.direction {
                    Direction::Asc => format!("{} ASC NULLS FIRST", quote(&o.field)),
                    Direction::Desc => format!("{} DESC NULLS LAST", quote(&o.field)),
                })
                .collect();
            self.push(&format!(" ORDER BY {}", list.join(", ")));
        }
        if let Some(limit) = select.limit {
            self.push(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = select.offset {
            self.push(&format!(" OFFSET {offset}"));
        }
    }
}

impl SqlStatement {
    /// Renders parameterized SQL.
    #[must_use]
    pub fn render(&self) -> RenderedSql {
        let mut r = Renderer::default();
        match self {
            SqlStatement::Select(select) => r.select(select, true),
            SqlStatement::Count(select) => {
                let needs_subquery = select.distinct != SqlDistinct::None
                    || !select.group_by.is_empty()
                    || select.limit.is_some()
                    || select.offset.is_some();
                if needs_subquery {
                    r.push(&format!("SELECT COUNT(*) AS {} FROM (", quote(COUNT_COLUMN)));
                    r.select(select, true);
                    r.push(") AS \"q\"");
                } else {
                    r.push(&format!(
                        "SELECT COUNT(*) AS {} FROM {}",
                        quote(COUNT_COLUMN),
                        quote(&select.table)
                    ));
                    if let Some(filter) = &select.filter {
                        r.push(" WHERE ");
                        r.expr(filter);
                    }
                }
            }
            SqlStatement::Insert(insert) => {
                let columns: Vec<String> = insert.row.names().map(quote).collect();
                r.push(&format!(
                    "INSERT INTO {} ({}) VALUES (",
                    quote(&insert.table),
                    columns.join(", ")
                ));
                for (i, (_, value)) in insert.row.iter().enumerate() {
                    if i > 0 {
                        r.push(", ");
                    }
                    r.param(value);
                }
                r.push(") RETURNING *");
            }
            SqlStatement::Update(update) => {
                r.push(&format!("UPDATE {} SET ", quote(&update.table)));
                for (i, (column, value)) in update.assignments.iter().enumerate() {
                    if i > 0 {
                        r.push(", ");
                    }
                    r.push(&quote(column));
                    r.push(" = ");
                    r.param(value);
                }
                r.push(" WHERE ");
                r.expr(&update.filter);
                r.push(" RETURNING *");
            }
            SqlStatement::Delete(delete) => {
                r.push(&format!("DELETE FROM {} WHERE ", quote(&delete.table)));
                r.expr(&delete.filter);
            }
        }
        RenderedSql {
            text: r.text,
            params: r.params,
        }
    }
}

fn predicate_expr(predicate: &Predicate) -> SqlExpr {
    let column = predicate.field.clone();
    let value = predicate.value.clone();
    let compare = |op| SqlExpr::Compare {
        column: predicate.field.clone(),
        op,
        value: predicate.value.clone(),
    };
    let like = |pattern| SqlExpr::Like {
        column: predicate.field.clone(),
        pattern,
    };
    let literal = predicate.value.as_text().map(escape_like).unwrap_or_default();
    match predicate.op {
        Operator::Eq => SqlExpr::equals(column, value),
        Operator::Ne if value.is_null() => SqlExpr::IsNull {
            column,
            negated: true,
        },
        Operator::Ne => compare(CompareOp::Ne),
        Operator::Gt => compare(CompareOp::Gt),
        Operator::Gte => compare(CompareOp::Gte),
        Operator::Lt => compare(CompareOp::Lt),
        Operator::Lte => compare(CompareOp::Lte),
        Operator::In | Operator::NotIn => {
            let negated = predicate.op == Operator::NotIn;
            match value {
                Value::Array(values) if !values.is_empty() => SqlExpr::InList {
                    column,
                    values,
                    negated,
                },
                _ if negated => SqlExpr::IsNull {
                    column,
                    negated: true,
                },
                _ => SqlExpr::Literal(false),
            }
        }
        Operator::Contains => like(format!("%{literal}%")),
        Operator::StartsWith => like(format!("{literal}%")),
        Operator::EndsWith => like(format!("%{literal}")),
    }
}

/// Expands a keyset bound into `(a > $1) OR (a = $2 AND b > $3) ...`,
/// honoring direction and the nulls-first-ascending order.
fn keyset_expr(bound: &KeysetBound) -> SqlExpr {
    let mut terms = Vec::with_capacity(bound.order.len());
    for (i, (key, value)) in bound.order.iter().zip(&bound.values).enumerate() {
        let mut parts: Vec<SqlExpr> = bound.order[..i]
            .iter()
            .zip(&bound.values[..i])
            .map(|(k, v)| SqlExpr::equals(k.field.clone(), v.clone()))
            .collect();
        let column = key.field.clone();
        let strict = match (key.direction, value.is_null()) {
            (Direction::Asc, true) => SqlExpr::IsNull {
                column,
                negated: true,
            },
            (Direction::Asc, false) => SqlExpr::Compare {
                column,
                op: CompareOp::Gt,
                value: value.clone(),
            },
            (Direction::Desc, true) => SqlExpr::Literal(false),
            (Direction::Desc, false) => SqlExpr::Or(vec![
                SqlExpr::Compare {
                    column: column.clone(),
                    op: CompareOp::Lt,
                    value: value.clone(),
                },
                SqlExpr::IsNull {
                    column,
                    negated: false,
                },
            ]),
        };
        if matches!(strict, SqlExpr::Literal(false)) {
            continue;
        }
        parts.push(strict);
        terms.push(if parts.len() == 1 {
            parts.remove(0)
        } else {
            SqlExpr::And(parts)
        });
    }
    SqlExpr::Or(terms)
}

fn where_clause(spec: &QuerySpec) -> Option<SqlExpr> {
    let mut parts: Vec<SqlExpr> = spec.predicates().iter().map(predicate_expr).collect();
    if let Some(bound) = spec.keyset() {
        parts.push(keyset_expr(bound));
    }
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(SqlExpr::And(parts)),
    }
}

/// Leading ORDER BY keys must be the DISTINCT ON columns.
fn distinct_on_order(on: &[String], order: &[OrderBy]) -> Vec<OrderBy> {
    if order.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<OrderBy> = on
        .iter()
        .map(|f| {
            order
                .iter()
                .find(|o| &o.field == f)
                .cloned()
                .unwrap_or_else(|| OrderBy::asc(f.clone()))
        })
        .collect();
    out.extend(order.iter().filter(|o| !on.contains(&o.field)).cloned());
    out
}

/// Translates a spec into a `SELECT` against `schema.table`.
///
/// # Errors
///
/// Returns `InvalidQuery` for unknown fields or malformed operands.
pub fn translate_select(spec: &QuerySpec, schema: &ModelSchema) -> CoreResult<SqlSelect> {
    validate_spec(spec, schema)?;
    let (distinct, order_by) = match spec.distinct_mode() {
        Distinct::None => (SqlDistinct::None, spec.order().to_vec()),
        Distinct::All => (SqlDistinct::All, spec.order().to_vec()),
        Distinct::On(on) => (SqlDistinct::On(on.clone()), distinct_on_order(on, spec.order())),
    };
    Ok(SqlSelect {
        table: schema.table.clone(),
        distinct,
        columns: spec.projection().map(<[String]>::to_vec),
        filter: where_clause(spec),
        group_by: spec.grouping().to_vec(),
        order_by,
        limit: spec.take_count(),
        offset: spec.skip_count(),
    })
}

/// Translates a spec into a row (or group) count, ignoring order and paging.
///
/// # Errors
///
/// Returns `InvalidQuery` for unknown fields or malformed operands.
pub fn translate_count(spec: &QuerySpec, schema: &ModelSchema) -> CoreResult<SqlSelect> {
    let mut select = translate_select(spec, schema)?;
    select.order_by.clear();
    select.limit = None;
    select.offset = None;
    if select.distinct == SqlDistinct::None && select.group_by.is_empty() {
        select.columns = None;
    }
    Ok(select)
}
