//! In-process SQL client that interprets the statement IR directly.
//!
//! Used as the reference relational backend in tests and examples. It
//! enforces unique constraints, honors LIKE escapes, and can inject
//! transport failures before or after a statement applies.

use super::relational::{SqlClient, SqlOutcome};
use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::query::{compare, shape_rows, Distinct, Operator, ShapeOptions};
use crate::record::{field, Record};
use crate::schema::ModelSchema;
use crate::translate::{RenderedSql, SqlDistinct, SqlExpr, SqlSelect, SqlStatement};
use parking_lot::{Mutex, RwLock};
use polystore_codec::Value;
use std::collections::HashMap;

const SCAN_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Record>,
    unique: Vec<String>,
}

impl Table {
    fn with_unique(unique: Vec<String>) -> Self {
        let mut unique = unique;
        if !unique.iter().any(|c| c == field::ID) {
            unique.insert(0, field::ID.to_string());
        }
        Self {
            rows: Vec::new(),
            unique,
        }
    }

    /// First unique column on which `row` collides with a row other than `skip`.
    fn collision(&self, row: &Record, skip: Option<usize>) -> Option<&str> {
        self.unique.iter().map(String::as_str).find(|column| {
            let value = row.get_or_null(column);
            !value.is_null()
                && self
                    .rows
                    .iter()
                    .enumerate()
                    .any(|(i, other)| Some(i) != skip && other.get_or_null(column) == value)
        })
    }
}

#[derive(Debug, Default)]
struct Faults {
    before_apply: usize,
    after_apply: usize,
}

/// Reference [`SqlClient`] holding tables in memory.
#[derive(Debug)]
pub struct MemorySqlClient {
    name: String,
    tables: RwLock<HashMap<String, Table>>,
    history: Mutex<Vec<RenderedSql>>,
    faults: Mutex<Faults>,
}

impl Default for MemorySqlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySqlClient {
    /// Creates an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory-sql")
    }

    /// Creates an empty client reporting `name` in connection errors.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Creates (or resets) `table` with unique constraints on `unique`
    /// columns. `id` is always unique.
    pub fn define_table<I, S>(&self, table: &str, unique: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique = unique.into_iter().map(Into::into).collect();
        self.tables
            .write()
            .insert(table.to_string(), Table::with_unique(unique));
    }

    /// Creates the table backing `schema` with its unique fields.
    pub fn define_table_for(&self, schema: &ModelSchema) {
        self.define_table(&schema.table, schema.unique_fields());
    }

    /// Makes the next `n` statements fail without applying.
    pub fn fail_next(&self, n: usize) {
        self.faults.lock().before_apply = n;
    }

    /// Makes the next `n` statements apply and then report a failure.
    pub fn fail_next_after_apply(&self, n: usize) {
        self.faults.lock().after_apply = n;
    }

    /// Rendered form of every statement received, oldest first.
    pub fn history(&self) -> Vec<RenderedSql> {
        self.history.lock().clone()
    }

    /// Forgets recorded statements.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Raw stored rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn take_fault(&self, after: bool) -> bool {
        let mut faults = self.faults.lock();
        let slot = if after {
            &mut faults.after_apply
        } else {
            &mut faults.before_apply
        };
        if *slot > 0 {
            *slot -= 1;
            true
        } else {
            false
        }
    }

    fn apply(&self, statement: &SqlStatement, cancel: &CancelToken) -> CoreResult<SqlOutcome> {
        match statement {
            SqlStatement::Select(select) => {
                let tables = self.tables.read();
                let rows = filtered(tables.get(&select.table), select.filter.as_ref(), cancel)?;
                Ok(SqlOutcome::Rows(shape(rows, select)))
            }
            SqlStatement::Count(select) => {
                let tables = self.tables.read();
                let rows = filtered(tables.get(&select.table), select.filter.as_ref(), cancel)?;
                Ok(SqlOutcome::Count(shape(rows, select).len() as u64))
            }
            SqlStatement::Insert(insert) => {
                let mut tables = self.tables.write();
                let table = tables
                    .entry(insert.table.clone())
                    .or_insert_with(|| Table::with_unique(Vec::new()));
                if let Some(column) = table.collision(&insert.row, None) {
                    return Err(duplicate(&insert.table, column, &insert.row));
                }
                table.rows.push(insert.row.clone());
                Ok(SqlOutcome::Rows(vec![insert.row.clone()]))
            }
            SqlStatement::Update(update) => {
                let mut tables = self.tables.write();
                let Some(table) = tables.get_mut(&update.table) else {
                    return Ok(SqlOutcome::Rows(Vec::new()));
                };
                let targets: Vec<usize> = (0..table.rows.len())
                    .filter(|&i| eval(&table.rows[i], &update.filter))
                    .collect();
                let mut staged = Vec::with_capacity(targets.len());
                for &i in &targets {
                    let mut row = table.rows[i].clone();
                    for (column, value) in &update.assignments {
                        row.set(column.clone(), value.clone());
                    }
                    if let Some(column) = table.collision(&row, Some(i)) {
                        return Err(duplicate(&update.table, column, &row));
                    }
                    staged.push((i, row));
                }
                let mut updated = Vec::with_capacity(staged.len());
                for (i, row) in staged {
                    table.rows[i] = row.clone();
                    updated.push(row);
                }
                Ok(SqlOutcome::Rows(updated))
            }
            SqlStatement::Delete(delete) => {
                let mut tables = self.tables.write();
                let Some(table) = tables.get_mut(&delete.table) else {
                    return Ok(SqlOutcome::Affected(0));
                };
                let before = table.rows.len();
                table.rows.retain(|row| !eval(row, &delete.filter));
                Ok(SqlOutcome::Affected((before - table.rows.len()) as u64))
            }
        }
    }
}

impl SqlClient for MemorySqlClient {
    fn execute(&self, statement: &SqlStatement, cancel: &CancelToken) -> CoreResult<SqlOutcome> {
        self.history.lock().push(statement.render());
        if self.take_fault(false) {
            return Err(CoreError::connection(&self.name, "injected failure", false));
        }
        let outcome = self.apply(statement, cancel)?;
        if self.take_fault(true) {
            return Err(CoreError::connection(
                &self.name,
                "injected failure after apply",
                true,
            ));
        }
        Ok(outcome)
    }
}

fn duplicate(table: &str, column: &str, row: &Record) -> CoreError {
    CoreError::conflict(
        table,
        column,
        format!("duplicate value {} for unique column {column}", row.get_or_null(column)),
    )
}

fn filtered(
    table: Option<&Table>,
    filter: Option<&SqlExpr>,
    cancel: &CancelToken,
) -> CoreResult<Vec<Record>> {
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for (i, row) in table.rows.iter().enumerate() {
        if i % SCAN_CHECK_INTERVAL == 0 {
            cancel.check("sql scan")?;
        }
        if filter.map_or(true, |f| eval(row, f)) {
            out.push(row.clone());
        }
    }
    Ok(out)
}

fn shape(rows: Vec<Record>, select: &SqlSelect) -> Vec<Record> {
    let distinct = match &select.distinct {
        SqlDistinct::None => Distinct::None,
        SqlDistinct::All => Distinct::All,
        SqlDistinct::On(columns) => Distinct::On(columns.clone()),
    };
    let options = ShapeOptions {
        order: &select.order_by,
        distinct: &distinct,
        group_by: &select.group_by,
        projection: select.columns.as_deref(),
        skip: select.offset,
        take: select.limit,
    };
    shape_rows(rows, &options)
}

fn eval(row: &Record, expr: &SqlExpr) -> bool {
    match expr {
        SqlExpr::Compare { column, op, value } => {
            compare(row.get_or_null(column), op.operator(), value)
        }
        SqlExpr::IsNull { column, negated } => row.get_or_null(column).is_null() != *negated,
        SqlExpr::InList {
            column,
            values,
            negated,
        } => {
            let op = if *negated { Operator::NotIn } else { Operator::In };
            compare(row.get_or_null(column), op, &Value::Array(values.clone()))
        }
        SqlExpr::Like { column, pattern } => row
            .get_or_null(column)
            .to_match_text()
            .is_some_and(|text| like_matches(&text, pattern)),
        SqlExpr::And(items) => items.iter().all(|e| eval(row, e)),
        SqlExpr::Or(items) => items.iter().any(|e| eval(row, e)),
        SqlExpr::Literal(b) => *b,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    Any,
    One,
    Char(char),
}

fn like_tokens(pattern: &str) -> Vec<LikeToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '\\' => LikeToken::Char(chars.next().unwrap_or('\\')),
            '%' => LikeToken::Any,
            '_' => LikeToken::One,
            other => LikeToken::Char(other),
        });
    }
    tokens
}

/// `LIKE` with `\` as the escape character.
fn like_matches(text: &str, pattern: &str) -> bool {
    let tokens = like_tokens(pattern);
    let text: Vec<char> = text.chars().collect();
    // matched[j]: tokens[..i] match text[..j]
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for token in tokens {
        let mut next = vec![false; text.len() + 1];
        match token {
            LikeToken::Any => {
                let mut any = false;
                for j in 0..=text.len() {
                    any |= matched[j];
                    next[j] = any;
                }
            }
            LikeToken::One => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1];
                }
            }
            LikeToken::Char(c) => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1] && text[j - 1] == c;
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Operator, OrderBy, QuerySpec};
    use crate::schema::FieldDef;
    use crate::translate::{translate_select, SqlInsert};

    fn users() -> ModelSchema {
        ModelSchema::relational("User", "users")
            .field(FieldDef::text("name"))
            .field(FieldDef::text("email").unique())
            .field(FieldDef::integer("age"))
    }

    fn seeded() -> MemorySqlClient {
        let client = MemorySqlClient::new();
        client.define_table_for(&users());
        for (id, name, email, age) in [
            ("u1", "Ann", "ann@x.io", Some(41)),
            ("u2", "Bob_1", "bob@x.io", Some(29)),
            ("u3", "Cy%", "cy@x.io", None),
        ] {
            let row = Record::new()
                .with("id", id)
                .with("name", name)
                .with("email", email)
                .with("age", age.map(i64::from));
            client
                .execute(
                    &SqlStatement::Insert(SqlInsert {
                        table: "users".into(),
                        row,
                    }),
                    &CancelToken::new(),
                )
                .unwrap();
        }
        client
    }

    fn select(client: &MemorySqlClient, spec: QuerySpec) -> Vec<Record> {
        let stmt = SqlStatement::Select(translate_select(&spec, &users()).unwrap());
        match client.execute(&stmt, &CancelToken::new()).unwrap() {
            SqlOutcome::Rows(rows) => rows,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn like_honors_escapes() {
        assert!(like_matches("Bob_1", "Bob\\_%"));
        assert!(!like_matches("Bobx1", "Bob\\_%"));
        assert!(like_matches("Bobx1", "Bob_%"));
        assert!(like_matches("50%", "%\\%"));
        assert!(!like_matches("50", "%\\%"));
        assert!(like_matches("", "%"));
    }

    #[test]
    fn pattern_predicates_match_literally() {
        let client = seeded();
        let rows = select(&client, QuerySpec::new().filter("name", Operator::Contains, "_"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), Some("u2"));
        let rows = select(&client, QuerySpec::new().filter("name", Operator::EndsWith, "%"));
        assert_eq!(rows[0].id(), Some("u3"));
    }

    #[test]
    fn nulls_sort_first_ascending() {
        let client = seeded();
        let rows = select(&client, QuerySpec::new().order_by(OrderBy::asc("age")));
        let ids: Vec<_> = rows.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["u3", "u2", "u1"]);
    }

    #[test]
    fn unique_columns_conflict() {
        let client = seeded();
        let err = client
            .execute(
                &SqlStatement::Insert(SqlInsert {
                    table: "users".into(),
                    row: Record::new().with("id", "u9").with("email", "ann@x.io"),
                }),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { ref field, .. } if field == "email"));
        assert_eq!(client.rows("users").len(), 3);
    }

    #[test]
    fn injected_failures_report_application() {
        let client = seeded();
        let stmt = SqlStatement::Select(SqlSelect::by_id("users", "u1"));
        client.fail_next(1);
        let err = client.execute(&stmt, &CancelToken::new()).unwrap_err();
        assert!(!err.may_have_applied());
        client.fail_next_after_apply(1);
        let err = client.execute(&stmt, &CancelToken::new()).unwrap_err();
        assert!(err.may_have_applied());
        assert!(client.execute(&stmt, &CancelToken::new()).is_ok());
        assert_eq!(client.history().len(), 6);
    }

    #[test]
    fn cancelled_scan_surfaces_cancelled() {
        let client = seeded();
        let cancel = CancelToken::new();
        cancel.cancel();
        let stmt = SqlStatement::Select(translate_select(&QuerySpec::new(), &users()).unwrap());
        assert!(matches!(
            client.execute(&stmt, &cancel),
            Err(CoreError::Cancelled { .. })
        ));
    }
}
