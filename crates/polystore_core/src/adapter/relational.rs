//! Adapter for relational stores speaking SQL.

use super::{
    acquire, reject_soft_delete, write_race, BackendAdapter, QueryOutput, RecordKey, UpdateOutcome,
    MAX_WRITE_RACES,
};
use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::query::QuerySpec;
use crate::record::{field, FieldChanges, Record};
use crate::schema::{ModelSchema, StorageFamily};
use crate::translate::{
    translate_count, translate_select, SqlDelete, SqlExpr, SqlInsert, SqlSelect, SqlStatement,
    SqlUpdate,
};
use polystore_codec::Value;
use polystore_storage::{PermitPool, PoolConfig};
use std::sync::Arc;

/// Result of executing one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlOutcome {
    /// Rows from `SELECT` or `RETURNING`.
    Rows(Vec<Record>),
    /// Result of a count statement.
    Count(u64),
    /// Rows affected by a statement without `RETURNING`.
    Affected(u64),
}

/// Vendor client boundary for SQL databases.
///
/// Implementations render the statement (see [`SqlStatement::render`]),
/// bind parameters and map vendor errors: unique violations to
/// `Conflict`, transport failures to `Connection`.
pub trait SqlClient: Send + Sync {
    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Vendor failures mapped to [`CoreError`].
    fn execute(&self, statement: &SqlStatement, cancel: &CancelToken) -> CoreResult<SqlOutcome>;
}

impl<C: SqlClient + ?Sized> SqlClient for Arc<C> {
    fn execute(&self, statement: &SqlStatement, cancel: &CancelToken) -> CoreResult<SqlOutcome> {
        (**self).execute(statement, cancel)
    }
}

/// [`BackendAdapter`] over a [`SqlClient`].
#[derive(Debug)]
pub struct RelationalAdapter<C> {
    name: String,
    client: C,
    pool: PermitPool,
}

impl<C: SqlClient> RelationalAdapter<C> {
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

    fn execute(
        &self,
        schema: &ModelSchema,
        statement: &SqlStatement,
        cancel: &CancelToken,
    ) -> CoreResult<SqlOutcome> {
        let _permit = acquire(&self.pool, &self.name)?;
        cancel.check("sql execute")?;
        self.client
            .execute(statement, cancel)
            .map_err(|err| err.for_model(&schema.name))
    }

    fn rows(&self, schema: &ModelSchema, statement: &SqlStatement) -> CoreResult<Vec<Record>> {
        match self.execute(schema, statement, &CancelToken::new())? {
            SqlOutcome::Rows(rows) => Ok(rows),
            other => Err(unexpected(&self.name, &other)),
        }
    }
}

fn unexpected(backend: &str, outcome: &SqlOutcome) -> CoreError {
    CoreError::invalid_operation(format!("{backend} returned an unexpected outcome: {outcome:?}"))
}

fn id_filter(id: &str) -> SqlExpr {
    SqlExpr::equals(field::ID, Value::from(id))
}

/// `id = $1` plus the guard, plus each changed column at its old value.
fn guarded_filter(id: &str, guard: &Record, changes: Option<&FieldChanges>) -> SqlExpr {
    let mut parts = vec![id_filter(id)];
    parts.extend(
        guard
            .iter()
            .map(|(name, value)| SqlExpr::equals(name.clone(), value.clone())),
    );
    if let Some(changes) = changes {
        parts.extend(
            changes
                .iter()
                .filter(|(name, _)| !guard.contains(name.as_str()))
                .map(|(name, change)| SqlExpr::equals(name.clone(), change.old.clone())),
        );
    }
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        SqlExpr::And(parts)
    }
}

impl<C: SqlClient> BackendAdapter for RelationalAdapter<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> StorageFamily {
        StorageFamily::Relational
    }

    fn create(&self, schema: &ModelSchema, record: &Record) -> CoreResult<Record> {
        let statement = SqlStatement::Insert(SqlInsert {
            table: schema.table.clone(),
            row: record.clone(),
        });
        let mut rows = self.rows(schema, &statement)?;
        tracing::debug!(backend = %self.name, model = %schema.name, id = record.id(), "row inserted");
        Ok(if rows.is_empty() {
            record.clone()
        } else {
            rows.swap_remove(0)
        })
    }

    fn read(
        &self,
        schema: &ModelSchema,
        spec: &QuerySpec,
        cancel: &CancelToken,
    ) -> CoreResult<QueryOutput> {
        let select = translate_select(spec, schema)?;
        match self.execute(schema, &SqlStatement::Select(select), cancel)? {
            SqlOutcome::Rows(records) => Ok(QueryOutput {
                records,
                warnings: Vec::new(),
            }),
            other => Err(unexpected(&self.name, &other)),
        }
    }

    fn update(
        &self,
        schema: &ModelSchema,
        key: &RecordKey,
        patch: &Record,
        guard: &Record,
    ) -> CoreResult<UpdateOutcome> {
        for attempt in 0..MAX_WRITE_RACES {
            let select = SqlSelect {
                filter: Some(guarded_filter(&key.id, guard, None)),
                ..SqlSelect::by_id(&schema.table, &key.id)
            };
            let current = self
                .rows(schema, &SqlStatement::Select(select))?
                .into_iter()
                .next()
                .ok_or_else(|| CoreError::not_found(&schema.name, &key.id))?;

            let mut changes = current.diff(patch);
            changes.remove(field::ID);
            if changes.is_empty() {
                return Ok(UpdateOutcome {
                    record: current,
                    changes,
                });
            }

            // Lands only if every changed column still holds its old value.
            let statement = SqlStatement::Update(SqlUpdate {
                table: schema.table.clone(),
                assignments: changes
                    .iter()
                    .map(|(name, change)| (name.clone(), change.new.clone()))
                    .collect(),
                filter: guarded_filter(&key.id, guard, Some(&changes)),
            });
            if let Some(record) = self.rows(schema, &statement)?.into_iter().next() {
                tracing::debug!(backend = %self.name, model = %schema.name, id = %key.id, fields = changes.len(), "row updated");
                return Ok(UpdateOutcome { record, changes });
            }
            tracing::debug!(backend = %self.name, model = %schema.name, id = %key.id, attempt, "row changed under update; re-reading");
        }
        Err(write_race(schema, &key.id))
    }

    fn delete(&self, schema: &ModelSchema, key: &RecordKey, hard: bool) -> CoreResult<()> {
        reject_soft_delete(hard)?;
        let statement = SqlStatement::Delete(SqlDelete {
            table: schema.table.clone(),
            filter: id_filter(&key.id),
        });
        match self.execute(schema, &statement, &CancelToken::new())? {
            SqlOutcome::Affected(0) => Err(CoreError::not_found(&schema.name, &key.id)),
            SqlOutcome::Affected(_) => Ok(()),
            other => Err(unexpected(&self.name, &other)),
        }
    }

    fn count(&self, schema: &ModelSchema, spec: &QuerySpec, cancel: &CancelToken) -> CoreResult<u64> {
        let select = translate_count(spec, schema)?;
        match self.execute(schema, &SqlStatement::Count(select), cancel)? {
            SqlOutcome::Count(n) => Ok(n),
            other => Err(unexpected(&self.name, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemorySqlClient;
    use crate::query::{Operator, OrderBy};
    use crate::schema::FieldDef;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Lets another writer in right before the first UPDATE lands.
    struct Interleaved {
        inner: MemorySqlClient,
        intruder: Mutex<Option<SqlStatement>>,
    }

    impl SqlClient for Interleaved {
        fn execute(&self, statement: &SqlStatement, cancel: &CancelToken) -> CoreResult<SqlOutcome> {
            if matches!(statement, SqlStatement::Update(_)) {
                if let Some(other) = self.intruder.lock().take() {
                    self.inner.execute(&other, cancel)?;
                }
            }
            self.inner.execute(statement, cancel)
        }
    }

    fn rename(id: &str, name: &str) -> SqlStatement {
        SqlStatement::Update(SqlUpdate {
            table: "users".into(),
            assignments: vec![("name".into(), Value::from(name))],
            filter: id_filter(id),
        })
    }

    fn users() -> ModelSchema {
        ModelSchema::relational("User", "users")
            .field(FieldDef::text("name"))
            .field(FieldDef::text("email").unique())
    }

    fn adapter() -> RelationalAdapter<MemorySqlClient> {
        let client = MemorySqlClient::new();
        client.define_table_for(&users());
        let adapter = RelationalAdapter::new("sql", client, PoolConfig::default());
        for (id, name, email) in [("u1", "Ann", "ann@x.io"), ("u2", "Bob", "bob@x.io")] {
            let row = Record::new()
                .with("id", id)
                .with("name", name)
                .with("email", email);
            adapter.create(&users(), &row).unwrap();
        }
        adapter
    }

    #[test]
    fn reads_render_parameterized_sql() {
        let adapter = adapter();
        adapter.client().clear_history();
        let spec = QuerySpec::new()
            .filter("name", Operator::StartsWith, "A")
            .order_by(OrderBy::asc("name"));
        let out = adapter.read(&users(), &spec, &CancelToken::new()).unwrap();
        assert_eq!(out.records.len(), 1);
        assert!(out.warnings.is_empty());
        let history = adapter.client().history();
        assert_eq!(
            history[0].text,
            "SELECT * FROM \"users\" WHERE \"name\" LIKE $1 ESCAPE '\\' ORDER BY \"name\" ASC NULLS FIRST"
        );
    }

    #[test]
    fn unique_violation_names_model() {
        let adapter = adapter();
        let dup = Record::new().with("id", "u3").with("email", "ann@x.io");
        let err = adapter.create(&users(), &dup).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict { ref model, ref field, .. } if model == "User" && field == "email"
        ));
    }

    #[test]
    fn update_writes_only_changed_columns() {
        let adapter = adapter();
        let patch = Record::new()
            .with("id", "u1")
            .with("name", "Ann")
            .with("email", "ann@new.io");
        let outcome = adapter
            .update(&users(), &RecordKey::id("u1"), &patch, &Record::new())
            .unwrap();
        assert_eq!(outcome.changes.keys().collect::<Vec<_>>(), vec!["email"]);
        let last = adapter.client().history().pop().unwrap();
        assert!(last.text.starts_with("UPDATE \"users\" SET \"email\" = $1"));

        let err = adapter
            .update(&users(), &RecordKey::id("missing"), &patch, &Record::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn unchanged_update_issues_no_write() {
        let adapter = adapter();
        let same = Record::new().with("name", "Bob");
        adapter.client().clear_history();
        let outcome = adapter
            .update(&users(), &RecordKey::id("u2"), &same, &Record::new())
            .unwrap();
        assert!(outcome.changes.is_empty());
        assert_eq!(adapter.client().history().len(), 1);
    }

    #[test]
    fn stale_update_rediffs_against_the_winner() {
        let inner = MemorySqlClient::new();
        inner.define_table_for(&users());
        let seed = Record::new().with("id", "u1").with("name", "Ann").with("email", "ann@x.io");
        inner
            .execute(
                &SqlStatement::Insert(SqlInsert {
                    table: "users".into(),
                    row: seed,
                }),
                &CancelToken::new(),
            )
            .unwrap();
        let client = Interleaved {
            inner,
            intruder: Mutex::new(Some(rename("u1", "Anna"))),
        };
        let adapter = RelationalAdapter::new("sql", client, PoolConfig::default());

        let patch = Record::new().with("name", "Annie");
        let outcome = adapter
            .update(&users(), &RecordKey::id("u1"), &patch, &Record::new())
            .unwrap();
        assert_eq!(outcome.changes["name"].old, Value::from("Anna"));
        assert_eq!(outcome.changes["name"].new, Value::from("Annie"));
        assert_eq!(adapter.client().inner.rows("users")[0].get("name"), Some(&Value::from("Annie")));

        let updates = adapter
            .client()
            .inner
            .history()
            .into_iter()
            .filter(|sql| sql.text.starts_with("UPDATE"))
            .count();
        assert_eq!(updates, 3);
    }

    #[test]
    fn guard_failure_reads_as_not_found() {
        let adapter = adapter();
        let guard = Record::new().with("email", "someone@else.io");
        let err = adapter
            .update(&users(), &RecordKey::id("u1"), &Record::new().with("name", "Zed"), &guard)
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));

        let guard = Record::new().with("email", "ann@x.io");
        let outcome = adapter
            .update(&users(), &RecordKey::id("u1"), &Record::new().with("name", "Zed"), &guard)
            .unwrap();
        assert_eq!(outcome.record.get("name"), Some(&Value::from("Zed")));
        let last = adapter.client().history().pop().unwrap();
        assert!(last.text.contains("\"email\" = $"));
    }

    #[test]
    fn concurrent_updates_report_each_old_value_once() {
        let adapter = Arc::new(adapter());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let adapter = Arc::clone(&adapter);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|round| {
                            let patch = Record::new().with("name", format!("{t}/{round}"));
                            let outcome = adapter
                                .update(&users(), &RecordKey::id("u1"), &patch, &Record::new())
                                .unwrap();
                            outcome.changes["name"].clone()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let changes: Vec<_> = threads.into_iter().flat_map(|h| h.join().unwrap()).collect();

        let mut olds = std::collections::HashSet::new();
        for change in &changes {
            assert!(olds.insert(change.old.clone()), "{:?} replaced twice", change.old);
        }
        assert!(olds.contains(&Value::from("Ann")));
    }

    #[test]
    fn hard_delete_and_count() {
        let adapter = adapter();
        let cancel = CancelToken::new();
        assert_eq!(adapter.count(&users(), &QuerySpec::new(), &cancel).unwrap(), 2);
        assert!(adapter.delete(&users(), &RecordKey::id("u1"), false).is_err());
        adapter.delete(&users(), &RecordKey::id("u1"), true).unwrap();
        assert_eq!(adapter.count(&users(), &QuerySpec::new(), &cancel).unwrap(), 1);
        assert!(matches!(
            adapter.delete(&users(), &RecordKey::id("u1"), true),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn held_permits_exhaust_the_pool() {
        let client = MemorySqlClient::new();
        let pool = PoolConfig::new(1, 1).acquire_timeout(Duration::from_millis(5));
        let adapter = RelationalAdapter::new("sql", client, pool);
        let _held = adapter.pool().acquire().unwrap();
        let err = adapter
            .read(&users(), &QuerySpec::new(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::PoolExhausted { .. }));
    }
}
