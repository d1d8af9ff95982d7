//! Audit entries and their hashes.

use crate::record::{changes_from_value, changes_to_value, FieldChanges};
use polystore_codec::{encode_canonical, CodecError, CodecResult, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest.
pub type EntryHash = [u8; 32];

/// `prev_hash` of the first entry in every tenant's chain.
pub const GENESIS_HASH: EntryHash = [0; 32];

/// Kind of mutation recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    /// Record created.
    Create,
    /// Record updated.
    Update,
    /// Record deleted (soft or hard).
    Delete,
}

impl AuditAction {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(AuditAction::Create),
            "update" => Some(AuditAction::Update),
            "delete" => Some(AuditAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation to be recorded, before it is placed in a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Tenant whose chain receives the entry.
    pub tenant_id: String,
    /// Acting user or service.
    pub actor_id: String,
    /// Roles held by the actor.
    pub roles: Vec<String>,
    /// Mutation kind.
    pub action: AuditAction,
    /// Model name.
    pub model: String,
    /// Id of the mutated record.
    pub entity_id: String,
    /// Field-level diff.
    pub changed_fields: FieldChanges,
    /// Trace id of the originating request.
    pub trace_id: Option<String>,
    /// Request id of the originating request.
    pub request_id: Option<String>,
}

/// One link in a tenant's audit chain.
///
/// `this_hash = SHA-256(prev_hash ‖ canonical(body))`, where the body is
/// every field except the two hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Position in the tenant's chain, from 0.
    pub sequence_no: u64,
    /// Tenant.
    pub tenant_id: String,
    /// Actor.
    pub actor_id: String,
    /// Actor roles.
    pub roles: Vec<String>,
    /// Mutation kind.
    pub action: AuditAction,
    /// Model name.
    pub model: String,
    /// Mutated record id.
    pub entity_id: String,
    /// Field-level diff with real (never stub) values.
    pub changed_fields: FieldChanges,
    /// Microseconds since the Unix epoch.
    pub timestamp_micros: i64,
    /// Trace id.
    pub trace_id: Option<String>,
    /// Request id.
    pub request_id: Option<String>,
    /// Hash of the previous entry, or [`GENESIS_HASH`].
    pub prev_hash: EntryHash,
    /// Hash of this entry.
    pub this_hash: EntryHash,
}

fn text_list(items: &[String]) -> Value {
    Value::Array(items.iter().map(Value::from).collect())
}

fn hash_from(value: Option<&Value>, name: &str) -> CodecResult<EntryHash> {
    value
        .and_then(Value::as_bytes)
        .and_then(|b| EntryHash::try_from(b).ok())
        .ok_or_else(|| CodecError::invalid_structure(format!("audit entry {name} must be 32 bytes")))
}

impl AuditEntry {
    /// Places `event` in a chain at `sequence_no` after `prev_hash`.
    #[must_use]
    pub fn seal(event: AuditEvent, sequence_no: u64, timestamp_micros: i64, prev_hash: EntryHash) -> Self {
        let mut entry = Self {
            sequence_no,
            tenant_id: event.tenant_id,
            actor_id: event.actor_id,
            roles: event.roles,
            action: event.action,
            model: event.model,
            entity_id: event.entity_id,
            changed_fields: event.changed_fields,
            timestamp_micros,
            trace_id: event.trace_id,
            request_id: event.request_id,
            prev_hash,
            this_hash: GENESIS_HASH,
        };
        entry.this_hash = entry.compute_hash(&prev_hash);
        entry
    }

    fn body_value(&self) -> Value {
        let sequence = i64::try_from(self.sequence_no).unwrap_or(i64::MAX);
        Value::text_map([
            ("sequence_no", Value::Integer(sequence)),
            ("tenant_id", Value::from(self.tenant_id.as_str())),
            ("actor_id", Value::from(self.actor_id.as_str())),
            ("roles", text_list(&self.roles)),
            ("action", Value::from(self.action.as_str())),
            ("model", Value::from(self.model.as_str())),
            ("entity_id", Value::from(self.entity_id.as_str())),
            ("changed_fields", changes_to_value(&self.changed_fields)),
            ("timestamp_micros", Value::Integer(self.timestamp_micros)),
            ("trace_id", Value::from(self.trace_id.as_deref())),
            ("request_id", Value::from(self.request_id.as_deref())),
        ])
    }

    /// Canonical encoding of the hashed body.
    #[must_use]
    pub fn body_bytes(&self) -> Vec<u8> {
        encode_canonical(&self.body_value())
    }

    /// `SHA-256(prev ‖ body_bytes())`.
    #[must_use]
    pub fn compute_hash(&self, prev: &EntryHash) -> EntryHash {
        let mut hasher = Sha256::new();
        hasher.update(prev);
        hasher.update(self.body_bytes());
        hasher.finalize().into()
    }

    /// Full entry, hashes included, as stored in the audit log.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut pairs = match self.body_value() {
            Value::Map(pairs) => pairs,
            _ => Vec::new(),
        };
        pairs.push((Value::from("prev_hash"), Value::Bytes(self.prev_hash.to_vec())));
        pairs.push((Value::from("this_hash"), Value::Bytes(self.this_hash.to_vec())));
        Value::map(pairs)
    }

    /// Inverse of [`AuditEntry::to_value`].
    ///
    /// # Errors
    ///
    /// Fails if a field is missing or has the wrong kind.
    pub fn from_value(value: &Value) -> CodecResult<Self> {
        let missing = |name: &str| CodecError::invalid_structure(format!("audit entry lacks {name}"));
        let text = |name: &str| -> CodecResult<String> {
            value
                .get(name)
                .and_then(Value::as_text)
                .map(str::to_string)
                .ok_or_else(|| missing(name))
        };
        let optional_text = |name: &str| -> CodecResult<Option<String>> {
            match value.get(name) {
                Some(Value::Null) => Ok(None),
                Some(Value::Text(s)) => Ok(Some(s.clone())),
                _ => Err(missing(name)),
            }
        };
        let integer = |name: &str| value.get(name).and_then(Value::as_integer).ok_or_else(|| missing(name));

        let sequence_no = u64::try_from(integer("sequence_no")?)
            .map_err(|_| CodecError::invalid_structure("negative sequence_no"))?;
        let roles = value
            .get("roles")
            .and_then(Value::as_array)
            .ok_or_else(|| missing("roles"))?
            .iter()
            .map(|r| r.as_text().map(str::to_string).ok_or_else(|| missing("roles")))
            .collect::<CodecResult<Vec<_>>>()?;
        let action = AuditAction::parse(&text("action")?)
            .ok_or_else(|| CodecError::invalid_structure("unknown audit action"))?;
        let changed_fields = changes_from_value(
            value
                .get("changed_fields")
                .cloned()
                .ok_or_else(|| missing("changed_fields"))?,
        )?;

        Ok(Self {
            sequence_no,
            tenant_id: text("tenant_id")?,
            actor_id: text("actor_id")?,
            roles,
            action,
            model: text("model")?,
            entity_id: text("entity_id")?,
            changed_fields,
            timestamp_micros: integer("timestamp_micros")?,
            trace_id: optional_text("trace_id")?,
            request_id: optional_text("request_id")?,
            prev_hash: hash_from(value.get("prev_hash"), "prev_hash")?,
            this_hash: hash_from(value.get("this_hash"), "this_hash")?,
        })
    }

    /// Returns true if `this_hash` matches the entry's own content.
    #[must_use]
    pub fn is_self_consistent(&self) -> bool {
        self.compute_hash(&self.prev_hash) == self.this_hash
    }
}

#[cfg(test)]
pub(crate) fn sample_event(tenant: &str, entity: &str) -> AuditEvent {
    use crate::record::FieldChange;
    let mut changed_fields = FieldChanges::new();
    changed_fields.insert("name".into(), FieldChange::new(Value::Null, "Ann"));
    AuditEvent {
        tenant_id: tenant.into(),
        actor_id: "alice".into(),
        roles: vec!["editor".into()],
        action: AuditAction::Create,
        model: "User".into(),
        entity_id: entity.into(),
        changed_fields,
        trace_id: Some("tr-1".into()),
        request_id: None,
    }
}
