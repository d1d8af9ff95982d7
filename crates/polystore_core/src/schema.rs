//! Model schemas and the startup-time registry.

use crate::error::{CoreError, CoreResult};
use crate::record::{field, Record};
use polystore_codec::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// The kind of store a model lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFamily {
    /// Row/column store queried through SQL.
    Relational,
    /// Document or key-value store addressed by partition and row key.
    Document,
}

/// Value kind a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Any value.
    Any,
    /// Boolean.
    Bool,
    /// Integer.
    Integer,
    /// Text.
    Text,
    /// Byte string.
    Bytes,
    /// Array.
    Array,
    /// Map.
    Map,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldKind::Any, _)
                | (_, Value::Null)
                | (FieldKind::Bool, Value::Bool(_))
                | (FieldKind::Integer, Value::Integer(_))
                | (FieldKind::Text, Value::Text(_))
                | (FieldKind::Bytes, Value::Bytes(_))
                | (FieldKind::Array, Value::Array(_))
                | (FieldKind::Map, Value::Map(_))
        )
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Accepted kind.
    pub kind: FieldKind,
    /// Must be present and non-null on create.
    pub required: bool,
    /// Values must be unique within the table (relational only).
    pub unique: bool,
    /// Values are sealed with [`crate::crypto::FieldEncryption`] at rest.
    pub encrypted: bool,
}

impl FieldDef {
    /// A field of the given kind.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            unique: false,
            encrypted: false,
        }
    }

    /// A text field.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    /// An integer field.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    /// A byte-string field.
    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bytes)
    }

    /// A field accepting any value.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Any)
    }

    /// Marks the field required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the field unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Encrypts the field at rest. Encrypted fields can be read, written
    /// and tested for null, but not filtered, ordered or grouped on.
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
}

/// Read caching for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
    /// Whether reads are cached.
    pub enabled: bool,
    /// Entry lifetime; `None` uses the configured default.
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    /// Caching off.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Caching on with the configured default TTL.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ttl: None,
        }
    }

    /// Caching on with an explicit TTL.
    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            enabled: true,
            ttl: Some(ttl),
        }
    }
}

/// Static description of one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSchema {
    /// Model (record type) name.
    pub name: String,
    /// Storage family.
    pub family: StorageFamily,
    /// Physical table or collection name.
    pub table: String,
    /// Declared fields, in declaration order.
    pub fields: Vec<FieldDef>,
    /// Partition key field (document models).
    pub partition_key: String,
    /// Row key field (document models).
    pub row_key: String,
    /// Read caching.
    pub cache: CachePolicy,
    /// Provider override; `None` uses the family default.
    pub provider: Option<String>,
}

impl ModelSchema {
    /// A relational model stored in `table`.
    pub fn relational(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(name.into(), StorageFamily::Relational, table.into())
    }

    /// A document model stored in `collection`, partitioned by tenant and
    /// keyed by id unless [`ModelSchema::keys`] says otherwise.
    pub fn document(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::new(name.into(), StorageFamily::Document, collection.into())
    }

    fn new(name: String, family: StorageFamily, table: String) -> Self {
        Self {
            name,
            family,
            table,
            fields: Vec::new(),
            partition_key: field::TENANT_ID.to_string(),
            row_key: field::ID.to_string(),
            cache: CachePolicy::disabled(),
            provider: None,
        }
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Sets document partition and row key fields.
    #[must_use]
    pub fn keys(mut self, partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self.row_key = row_key.into();
        self
    }

    /// Sets the cache policy.
    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    /// Routes the model to a named provider.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Looks up a declared field.
    #[must_use]
    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns true for implicit and declared fields.
    #[must_use]
    pub fn is_known_field(&self, name: &str) -> bool {
        field::is_implicit(name) || self.field_def(name).is_some()
    }

    /// Names of fields declared unique.
    pub fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter(|f| f.unique).map(|f| f.name.as_str())
    }

    /// Returns true if `name` identifies at most one record.
    #[must_use]
    pub fn is_unique_field(&self, name: &str) -> bool {
        name == field::ID || self.field_def(name).is_some_and(|f| f.unique)
    }

    /// Names of fields encrypted at rest, in declaration order.
    pub fn encrypted_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter(|f| f.encrypted).map(|f| f.name.as_str())
    }

    /// Returns true if `name` is encrypted at rest.
    #[must_use]
    pub fn is_encrypted(&self, name: &str) -> bool {
        self.field_def(name).is_some_and(|f| f.encrypted)
    }

    /// Fields that address a document and must never be moved out of line.
    #[must_use]
    pub fn key_fields(&self) -> Vec<&str> {
        match self.family {
            StorageFamily::Relational => vec![field::ID],
            StorageFamily::Document => {
                vec![field::ID, self.partition_key.as_str(), self.row_key.as_str()]
            }
        }
    }

    /// Checks structural consistency. Called by [`SchemaRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` describing the first problem found.
    pub fn validate(&self) -> CoreResult<()> {
        let fail = |message: String| Err(CoreError::invalid_schema(&self.name, message));
        if self.name.trim().is_empty() {
            return fail("model name is empty".into());
        }
        if self.table.trim().is_empty() {
            return fail("table/collection name is empty".into());
        }
        let mut seen = BTreeSet::new();
        for def in &self.fields {
            if def.name.is_empty() || def.name.starts_with('$') {
                return fail(format!("invalid field name {:?}", def.name));
            }
            if field::is_implicit(&def.name) {
                return fail(format!("field {} redefines an implicit field", def.name));
            }
            if !seen.insert(def.name.as_str()) {
                return fail(format!("field {} declared twice", def.name));
            }
            if def.encrypted && def.unique {
                return fail(format!("encrypted field {} cannot be unique", def.name));
            }
        }
        if self.family == StorageFamily::Document {
            for key in [&self.partition_key, &self.row_key] {
                if !self.is_known_field(key) {
                    return fail(format!("key field {key} is not a known field"));
                }
            }
            for key in [&self.partition_key, &self.row_key] {
                if self.is_encrypted(key) {
                    return fail(format!("key field {key} cannot be encrypted"));
                }
            }
            if self.partition_key == self.row_key {
                return fail("partition and row key must differ".into());
            }
            if self.fields.iter().any(|f| f.unique) {
                return fail("document models cannot declare unique fields".into());
            }
        }
        Ok(())
    }

    /// Checks user-supplied fields against declared kinds.
    ///
    /// Fields not declared are accepted as-is. With `creating`, required
    /// fields must be present and non-null.
    ///
    /// # Errors
    ///
    /// Returns `Validation` describing the first problem found.
    pub fn validate_fields(&self, record: &Record, creating: bool) -> CoreResult<()> {
        for (name, value) in record.iter() {
            if name.starts_with('$') {
                return Err(CoreError::validation(
                    &self.name,
                    format!("field name {name} is reserved"),
                ));
            }
            if let Some(def) = self.field_def(name) {
                if !def.kind.accepts(value) {
                    return Err(CoreError::validation(
                        &self.name,
                        format!("field {name} expects {:?}, got {}", def.kind, value.kind_name()),
                    ));
                }
                if def.required && value.is_null() {
                    return Err(CoreError::validation(
                        &self.name,
                        format!("required field {name} is null"),
                    ));
                }
            }
        }
        if creating {
            if let Some(missing) = self
                .fields
                .iter()
                .find(|f| f.required && !record.contains(&f.name))
            {
                return Err(CoreError::validation(
                    &self.name,
                    format!("required field {} is missing", missing.name),
                ));
            }
        }
        Ok(())
    }
}

/// Registry of model schemas, populated at startup and then read-only.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    models: HashMap<String, Arc<ModelSchema>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and adds a schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` if the schema is inconsistent or the name is
    /// already registered.
    pub fn register(&mut self, schema: ModelSchema) -> CoreResult<Arc<ModelSchema>> {
        schema.validate()?;
        if self.models.contains_key(&schema.name) {
            return Err(CoreError::invalid_schema(&schema.name, "already registered"));
        }
        let schema = Arc::new(schema);
        self.models.insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Builder-style registration.
    ///
    /// # Errors
    ///
    /// See [`SchemaRegistry::register`].
    pub fn with(mut self, schema: ModelSchema) -> CoreResult<Self> {
        self.register(schema)?;
        Ok(self)
    }

    /// Looks up a schema by model name.
    ///
    /// # Errors
    ///
    /// Returns `ModelNotRegistered` if unknown.
    pub fn get(&self, name: &str) -> CoreResult<Arc<ModelSchema>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotRegistered {
                name: name.to_string(),
            })
    }

    /// Iterates registered schemas.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.models.values()
    }

    /// Number of registered models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> ModelSchema {
        ModelSchema::relational("User", "users")
            .field(FieldDef::text("name").required())
            .field(FieldDef::text("email").unique())
            .field(FieldDef::integer("age"))
    }

    #[test]
    fn registry_lookup() {
        let registry = SchemaRegistry::new().with(user()).unwrap();
        assert_eq!(registry.get("User").unwrap().table, "users");
        assert!(matches!(
            registry.get("Order"),
            Err(CoreError::ModelNotRegistered { .. })
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register(user()).unwrap();
        assert!(matches!(
            registry.register(user()),
            Err(CoreError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn structural_checks() {
        let redefined = ModelSchema::relational("X", "x").field(FieldDef::text("tenant_id"));
        assert!(redefined.validate().is_err());

        let duplicate = ModelSchema::relational("X", "x")
            .field(FieldDef::text("a"))
            .field(FieldDef::integer("a"));
        assert!(duplicate.validate().is_err());

        let unknown_key = ModelSchema::document("Order", "orders").keys("region", "id");
        assert!(unknown_key.validate().is_err());

        let custom_key = ModelSchema::document("Order", "orders")
            .field(FieldDef::text("region").required())
            .keys("region", "id");
        custom_key.validate().unwrap();
        assert_eq!(custom_key.key_fields(), vec!["id", "region", "id"]);

        assert!(ModelSchema::relational("X", "").validate().is_err());
    }

    #[test]
    fn encrypted_fields_cannot_address_or_index() {
        let unique = ModelSchema::relational("X", "x").field(FieldDef::text("ssn").unique().encrypted());
        assert!(matches!(unique.validate(), Err(CoreError::InvalidSchema { .. })));

        let sealed_key = ModelSchema::document("Order", "orders")
            .field(FieldDef::text("region").encrypted())
            .keys("region", "id");
        assert!(sealed_key.validate().is_err());

        let ok = user().field(FieldDef::text("ssn").encrypted());
        ok.validate().unwrap();
        assert_eq!(ok.encrypted_fields().collect::<Vec<_>>(), vec!["ssn"]);
        assert!(ok.is_encrypted("ssn"));
        assert!(!ok.is_encrypted("name"));
    }

    #[test]
    fn field_validation() {
        let schema = user();
        let ok = Record::new().with("name", "Ann").with("age", 3i64).with("extra", true);
        schema.validate_fields(&ok, true).unwrap();

        let wrong_kind = Record::new().with("name", "Ann").with("age", "three");
        assert!(matches!(
            schema.validate_fields(&wrong_kind, true),
            Err(CoreError::Validation { .. })
        ));

        let missing = Record::new().with("age", 3i64);
        assert!(schema.validate_fields(&missing, true).is_err());
        schema.validate_fields(&missing, false).unwrap();

        let reserved = Record::new().with("name", "Ann").with("$overflow", 1i64);
        assert!(schema.validate_fields(&reserved, true).is_err());
    }

    #[test]
    fn known_and_unique_fields() {
        let schema = user();
        assert!(schema.is_known_field("created_at"));
        assert!(schema.is_known_field("email"));
        assert!(!schema.is_known_field("nope"));
        assert!(schema.is_unique_field("id"));
        assert!(schema.is_unique_field("email"));
        assert!(!schema.is_unique_field("name"));
        assert_eq!(schema.unique_fields().collect::<Vec<_>>(), vec!["email"]);
    }
}
