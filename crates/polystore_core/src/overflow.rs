//! Moves oversized field values to a blob store and back.
//!
//! A spilled value is replaced in the primary record by a stub
//! `{"$overflow": {"store_key", "size", "checksum"}}`. Blobs are content
//! addressed (`overflow/<sha256-hex>` of the value's canonical encoding),
//! so identical values share one blob and re-spilling an unchanged value
//! yields an identical stub.

use crate::error::{CoreError, CoreResult};
use crate::query::hex_digest;
use crate::record::{field, FieldChange, FieldChanges, Record};
use crate::schema::ModelSchema;
use crate::stats::DatabaseStats;
use polystore_codec::{decode_canonical, encode_canonical, encoded_len, Value};
use polystore_storage::BlobStore;
use std::sync::Arc;

/// Field name marking a stub map.
pub const OVERFLOW_MARKER: &str = "$overflow";

/// Key prefix for overflow blobs.
pub const OVERFLOW_PREFIX: &str = "overflow/";

/// Reference to a value held in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowStub {
    /// Blob store key.
    pub store_key: String,
    /// Length of the canonical encoding, in bytes.
    pub size: u64,
    /// Hex SHA-256 of the canonical encoding.
    pub checksum: String,
}

impl OverflowStub {
    fn for_bytes(bytes: &[u8]) -> Self {
        let checksum = hex_digest(bytes);
        Self {
            store_key: format!("{OVERFLOW_PREFIX}{checksum}"),
            size: bytes.len() as u64,
            checksum,
        }
    }

    /// Stub value stored in place of the original.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let size = i64::try_from(self.size).unwrap_or(i64::MAX);
        Value::text_map([(
            OVERFLOW_MARKER,
            Value::text_map([
                ("store_key", Value::from(self.store_key.as_str())),
                ("size", Value::Integer(size)),
                ("checksum", Value::from(self.checksum.as_str())),
            ]),
        )])
    }

    /// Parses a stub, or `None` if `value` is not exactly stub-shaped.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let [(marker, inner)] = value.as_map()? else {
            return None;
        };
        if marker.as_text() != Some(OVERFLOW_MARKER) || inner.as_map()?.len() != 3 {
            return None;
        }
        let store_key = inner.get("store_key")?.as_text()?;
        let checksum = inner.get("checksum")?.as_text()?;
        let size = u64::try_from(inner.get("size")?.as_integer()?).ok()?;
        if !store_key.starts_with(OVERFLOW_PREFIX) {
            return None;
        }
        Some(Self {
            store_key: store_key.to_string(),
            size,
            checksum: checksum.to_string(),
        })
    }
}

/// Output of [`OverflowManager::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    /// Record to hand to the primary store.
    pub record: Record,
    /// Fields replaced by stubs, with their stubs.
    pub spilled: Vec<(String, OverflowStub)>,
}

/// Spills and restores oversized values.
pub struct OverflowManager {
    blobs: Arc<dyn BlobStore>,
    threshold: usize,
    stats: Option<Arc<DatabaseStats>>,
}

impl std::fmt::Debug for OverflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowManager")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl OverflowManager {
    /// Spills records whose canonical encoding exceeds `threshold` bytes.
    pub fn new(blobs: Arc<dyn BlobStore>, threshold: usize) -> Self {
        Self {
            blobs,
            threshold,
            stats: None,
        }
    }

    pub(crate) fn with_stats(mut self, stats: Arc<DatabaseStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Size limit for the primary record.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Makes `record` fit under the threshold by spilling its largest
    /// eligible fields, largest first.
    ///
    /// Every blob write is acknowledged before this returns, so a record
    /// referencing a stub is never written ahead of its blob. Key and
    /// implicit fields are never spilled.
    ///
    /// # Errors
    ///
    /// `Validation` if the record already contains stub-shaped values,
    /// `Storage` if a blob write fails.
    pub fn prepare(&self, schema: &ModelSchema, record: Record) -> CoreResult<Prepared> {
        if let Some((name, _)) = record
            .iter()
            .find(|(_, value)| OverflowStub::from_value(value).is_some())
        {
            return Err(CoreError::validation(
                &schema.name,
                format!("field {name} holds a reserved overflow stub"),
            ));
        }

        let mut record = record;
        let mut spilled = Vec::new();
        let mut size = encoded_len(&record.to_value());
        if size <= self.threshold {
            return Ok(Prepared { record, spilled });
        }

        let keys = schema.key_fields();
        let mut candidates: Vec<(String, usize)> = record
            .iter()
            .filter(|(name, _)| !field::is_implicit(name) && !keys.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), encoded_len(value)))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (name, value_len) in candidates {
            if size <= self.threshold {
                break;
            }
            let Some(value) = record.get(&name) else {
                continue;
            };
            let bytes = encode_canonical(value);
            let stub = OverflowStub::for_bytes(&bytes);
            let stub_value = stub.to_value();
            let stub_len = encoded_len(&stub_value);
            if stub_len >= value_len {
                break;
            }
            self.blobs.put(&stub.store_key, &bytes)?;
            tracing::info!(model = %schema.name, field = %name, size = bytes.len(), store_key = %stub.store_key, "spilled field to overflow store");
            if let Some(stats) = &self.stats {
                stats.record_overflow_spill();
            }
            record.set(name.clone(), stub_value);
            size = size - value_len + stub_len;
            spilled.push((name, stub));
        }

        if size > self.threshold {
            tracing::warn!(model = %schema.name, size, threshold = self.threshold, "record exceeds overflow threshold after spilling");
        }
        Ok(Prepared { record, spilled })
    }

    /// Replaces every stub in `record` with its original value.
    ///
    /// # Errors
    ///
    /// `OverflowIntegrity` if a blob is missing, fails its checksum, or
    /// does not decode.
    pub fn restore(&self, record: Record) -> CoreResult<Record> {
        let mut record = record;
        let stubs: Vec<(String, OverflowStub)> = record
            .iter()
            .filter_map(|(name, value)| OverflowStub::from_value(value).map(|s| (name.clone(), s)))
            .collect();
        for (name, stub) in stubs {
            let value = self.fetch(&stub)?;
            record.set(name, value);
        }
        Ok(record)
    }

    /// Restores a value if it is a stub, else returns it unchanged.
    ///
    /// # Errors
    ///
    /// As for [`OverflowManager::restore`].
    pub fn restore_value(&self, value: Value) -> CoreResult<Value> {
        match OverflowStub::from_value(&value) {
            Some(stub) => self.fetch(&stub),
            None => Ok(value),
        }
    }

    /// Restores stub values on both sides of each change, dropping changes
    /// whose restored sides are equal.
    ///
    /// # Errors
    ///
    /// As for [`OverflowManager::restore`].
    pub fn resolve_changes(&self, changes: FieldChanges) -> CoreResult<FieldChanges> {
        let mut resolved = FieldChanges::new();
        for (name, change) in changes {
            let old = self.restore_value(change.old)?;
            let new = self.restore_value(change.new)?;
            if old != new {
                resolved.insert(name, FieldChange { old, new });
            }
        }
        Ok(resolved)
    }

    fn fetch(&self, stub: &OverflowStub) -> CoreResult<Value> {
        let bytes = self
            .blobs
            .get(&stub.store_key)?
            .ok_or_else(|| CoreError::overflow_integrity(&stub.store_key, "blob is missing"))?;
        if bytes.len() as u64 != stub.size || hex_digest(&bytes) != stub.checksum {
            return Err(CoreError::overflow_integrity(
                &stub.store_key,
                "blob does not match its checksum",
            ));
        }
        let value = decode_canonical(&bytes).map_err(|err| {
            CoreError::overflow_integrity(&stub.store_key, format!("blob does not decode: {err}"))
        })?;
        if let Some(stats) = &self.stats {
            stats.record_overflow_restore();
        }
        Ok(value)
    }
}
