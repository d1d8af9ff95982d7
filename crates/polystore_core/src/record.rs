//! Records, implicit fields and field-level changes.

use polystore_codec::{CodecError, CodecResult, Value};
use std::collections::BTreeMap;

/// Names of the fields every record carries.
pub mod field {
    /// Record identity.
    pub const ID: &str = "id";
    /// Owning tenant.
    pub const TENANT_ID: &str = "tenant_id";
    /// Creation timestamp (RFC 3339, microseconds, UTC).
    pub const CREATED_AT: &str = "created_at";
    /// Creating actor.
    pub const CREATED_BY: &str = "created_by";
    /// Last modification timestamp.
    pub const UPDATED_AT: &str = "updated_at";
    /// Last modifying actor.
    pub const UPDATED_BY: &str = "updated_by";
    /// Soft-delete timestamp; null while the record is live.
    pub const DELETED_AT: &str = "deleted_at";
    /// Soft-deleting actor.
    pub const DELETED_BY: &str = "deleted_by";

    /// All implicit fields.
    pub const IMPLICIT: [&str; 8] = [
        ID, TENANT_ID, CREATED_AT, CREATED_BY, UPDATED_AT, UPDATED_BY, DELETED_AT, DELETED_BY,
    ];

    /// Returns true if `name` is an implicit field.
    #[must_use]
    pub fn is_implicit(name: &str) -> bool {
        IMPLICIT.contains(&name)
    }
}

/// A record: field name to value, kept in name order.
///
/// Missing fields and null fields are treated alike by queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a field value, treating missing as null.
    #[must_use]
    pub fn get_or_null(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    /// Removes a field.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Returns true if the field is present (even if null).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Iterates field names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Mutable access to a field value.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.get_mut(name)
    }

    /// Overwrites fields with those present in `patch`.
    pub fn merge(&mut self, patch: &Record) {
        for (name, value) in &patch.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Returns a copy restricted to `names`.
    #[must_use]
    pub fn project(&self, names: &[String]) -> Record {
        names
            .iter()
            .filter_map(|n| self.fields.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    }

    /// The `id` field as text.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.text(field::ID)
    }

    /// The `tenant_id` field as text.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.text(field::TENANT_ID)
    }

    /// The `created_at` timestamp.
    #[must_use]
    pub fn created_at(&self) -> Option<&str> {
        self.text(field::CREATED_AT)
    }

    /// The `created_by` actor.
    #[must_use]
    pub fn created_by(&self) -> Option<&str> {
        self.text(field::CREATED_BY)
    }

    /// The `updated_at` timestamp.
    #[must_use]
    pub fn updated_at(&self) -> Option<&str> {
        self.text(field::UPDATED_AT)
    }

    /// The `updated_by` actor.
    #[must_use]
    pub fn updated_by(&self) -> Option<&str> {
        self.text(field::UPDATED_BY)
    }

    /// The `deleted_at` timestamp, if soft-deleted.
    #[must_use]
    pub fn deleted_at(&self) -> Option<&str> {
        self.text(field::DELETED_AT)
    }

    /// The `deleted_by` actor, if soft-deleted.
    #[must_use]
    pub fn deleted_by(&self) -> Option<&str> {
        self.text(field::DELETED_BY)
    }

    /// Returns true if the record carries a non-null `deleted_at`.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        !self.get_or_null(field::DELETED_AT).is_null()
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_text)
    }

    /// Converts to a text-keyed map value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::text_map(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Builds a record from a text-keyed map value.
    ///
    /// # Errors
    ///
    /// Fails if `value` is not a map or has non-text keys.
    pub fn from_value(value: Value) -> CodecResult<Self> {
        let pairs = match value {
            Value::Map(pairs) => pairs,
            other => {
                return Err(CodecError::invalid_structure(format!(
                    "record must be a map, got {}",
                    other.kind_name()
                )))
            }
        };
        pairs
            .into_iter()
            .map(|(k, v)| match k {
                Value::Text(name) => Ok((name, v)),
                other => Err(CodecError::invalid_structure(format!(
                    "record keys must be text, got {}",
                    other.kind_name()
                ))),
            })
            .collect()
    }

    /// Fields of `patch` whose value differs from this record's.
    ///
    /// A field missing here compares as null.
    #[must_use]
    pub fn diff(&self, patch: &Record) -> FieldChanges {
        patch
            .iter()
            .filter(|(name, new)| self.get_or_null(name) != *new)
            .map(|(name, new)| {
                (
                    name.clone(),
                    FieldChange {
                        old: self.get_or_null(name).clone(),
                        new: new.clone(),
                    },
                )
            })
            .collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl TryFrom<serde_json::Value> for Record {
    type Error = CodecError;

    fn try_from(json: serde_json::Value) -> CodecResult<Self> {
        Record::from_value(Value::try_from(json)?)
    }
}

impl From<&Record> for serde_json::Value {
    fn from(record: &Record) -> Self {
        serde_json::Value::from(&record.to_value())
    }
}

/// Old and new value of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Value before the mutation (null if absent).
    pub old: Value,
    /// Value after the mutation (null if removed).
    pub new: Value,
}

impl FieldChange {
    /// Creates a change.
    pub fn new(old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    fn to_value(&self) -> Value {
        Value::text_map([("old", self.old.clone()), ("new", self.new.clone())])
    }
}

/// Changed fields, keyed by field name.
pub type FieldChanges = BTreeMap<String, FieldChange>;

/// Encodes changes as `{field: {"old": .., "new": ..}}`.
#[must_use]
pub fn changes_to_value(changes: &FieldChanges) -> Value {
    Value::text_map(changes.iter().map(|(k, c)| (k.clone(), c.to_value())))
}

/// Inverse of [`changes_to_value`].
///
/// # Errors
///
/// Fails if the value does not have the expected shape.
pub fn changes_from_value(value: Value) -> CodecResult<FieldChanges> {
    let record = Record::from_value(value)?;
    record
        .into_iter()
        .map(|(name, change)| {
            let (Some(old), Some(new)) = (change.get("old"), change.get("new")) else {
                return Err(CodecError::invalid_structure(format!(
                    "change for {name} lacks old/new"
                )));
            };
            Ok((name, FieldChange::new(old.clone(), new.clone())))
        })
        .collect()
}
