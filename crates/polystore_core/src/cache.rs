//! Read-through result cache with generation-based invalidation.
//!
//! Entries live under `pc:{tenant}:{model}:g{generation}:{fingerprint}`.
//! The generation for a (tenant, model) pair is itself stored in the cache
//! under `pcg:{tenant}:{model}`. Invalidation bumps it, orphaning every
//! entry of the old generation at once; orphans expire by TTL.
//!
//! A miss hands out a [`CacheTicket`] pinned to the generation seen before
//! the backend read. If a write invalidates in between, the late populate
//! lands under the old generation where no reader looks.

use crate::adapter::QueryOutput;
use crate::error::{CoreError, CoreResult};
use crate::query::{hex_digest, QuerySpec};
use crate::record::Record;
use crate::schema::ModelSchema;
use crate::stats::DatabaseStats;
use crate::translate::QueryWarning;
use parking_lot::Mutex;
use polystore_codec::{decode_canonical, encode_canonical, CodecError, Value};
use polystore_storage::CacheStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a cached entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Query rows.
    Rows,
    /// A count.
    Count,
}

impl CacheKind {
    fn tag(self) -> &'static str {
        match self {
            CacheKind::Rows => "rows",
            CacheKind::Count => "count",
        }
    }
}

/// A cached result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached {
    /// Query output.
    Rows(QueryOutput),
    /// Count result.
    Count(u64),
}

impl Cached {
    fn to_value(&self) -> Value {
        match self {
            Cached::Rows(output) => Value::text_map([
                (
                    "records",
                    Value::Array(output.records.iter().map(Record::to_value).collect()),
                ),
                (
                    "warnings",
                    Value::Array(output.warnings.iter().map(QueryWarning::to_value).collect()),
                ),
            ]),
            Cached::Count(n) => {
                Value::text_map([("count", Value::Integer(i64::try_from(*n).unwrap_or(i64::MAX)))])
            }
        }
    }

    fn from_value(kind: CacheKind, value: Value) -> Result<Self, CodecError> {
        let malformed = || CodecError::invalid_structure("malformed cache payload");
        match kind {
            CacheKind::Rows => {
                let records = value
                    .get("records")
                    .and_then(Value::as_array)
                    .ok_or_else(malformed)?
                    .iter()
                    .cloned()
                    .map(Record::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                let warnings = value
                    .get("warnings")
                    .and_then(Value::as_array)
                    .ok_or_else(malformed)?
                    .iter()
                    .map(|w| QueryWarning::from_value(w).ok_or_else(malformed))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Cached::Rows(QueryOutput { records, warnings }))
            }
            CacheKind::Count => value
                .get("count")
                .and_then(Value::as_integer)
                .and_then(|n| u64::try_from(n).ok())
                .map(Cached::Count)
                .ok_or_else(malformed),
        }
    }
}

/// Permission to populate one entry, pinned to a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTicket {
    key: String,
    ttl: Option<Duration>,
}

impl CacheTicket {
    /// Entry key the ticket populates.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Entry found.
    Hit(Cached),
    /// Entry absent; populate with the ticket after reading the backend.
    Miss(CacheTicket),
}

type PairLocks = HashMap<(String, String), Arc<Mutex<()>>>;

/// Cache front for query results.
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    default_ttl: Option<Duration>,
    locks: Mutex<PairLocks>,
    stats: Option<Arc<DatabaseStats>>,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

fn generation_key(tenant: &str, model: &str) -> String {
    format!("pcg:{tenant}:{model}")
}

/// Fingerprint of a spec for one kind of result.
#[must_use]
pub fn result_fingerprint(kind: CacheKind, spec: &QuerySpec) -> String {
    let tagged = Value::Array(vec![Value::from(kind.tag()), spec.normalized()]);
    hex_digest(&encode_canonical(&tagged))
}

impl CacheLayer {
    /// Creates a cache over `store`; entries without a model TTL use
    /// `default_ttl`.
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Option<Duration>) -> Self {
        Self {
            store,
            default_ttl,
            locks: Mutex::new(HashMap::new()),
            stats: None,
        }
    }

    pub(crate) fn with_stats(mut self, stats: Arc<DatabaseStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn pair_lock(&self, tenant: &str, model: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry((tenant.to_string(), model.to_string()))
            .or_default()
            .clone()
    }

    fn read_generation(&self, key: &str) -> CoreResult<Option<u64>> {
        Ok(self.store.get(key)?.and_then(|bytes| {
            let raw: [u8; 8] = bytes.as_slice().try_into().ok()?;
            Some(u64::from_le_bytes(raw))
        }))
    }

    fn write_generation(&self, key: &str, generation: u64) -> CoreResult<()> {
        self.store.set(key, generation.to_le_bytes().to_vec(), None)?;
        Ok(())
    }

    /// Current generation, seeding a random one if none is stored.
    ///
    /// Random seeds keep a fresh generation from colliding with entries
    /// written before the generation key was lost.
    fn generation(&self, tenant: &str, model: &str) -> CoreResult<u64> {
        let key = generation_key(tenant, model);
        if let Some(generation) = self.read_generation(&key)? {
            return Ok(generation);
        }
        let lock = self.pair_lock(tenant, model);
        let _guard = lock.lock();
        if let Some(generation) = self.read_generation(&key)? {
            return Ok(generation);
        }
        let seeded = rand::random::<u64>();
        self.write_generation(&key, seeded)?;
        Ok(seeded)
    }

    /// Looks up the result of `spec` against `schema` for `tenant`.
    ///
    /// Undecodable entries are treated as misses.
    ///
    /// # Errors
    ///
    /// `Storage` if the cache store fails.
    pub fn lookup(
        &self,
        tenant: &str,
        schema: &ModelSchema,
        kind: CacheKind,
        spec: &QuerySpec,
    ) -> CoreResult<CacheLookup> {
        let generation = self.generation(tenant, &schema.name)?;
        let key = format!(
            "pc:{tenant}:{}:g{generation}:{}",
            schema.name,
            result_fingerprint(kind, spec)
        );
        if let Some(bytes) = self.store.get(&key)? {
            match decode_canonical(&bytes)
                .map_err(CoreError::from)
                .and_then(|v| Cached::from_value(kind, v).map_err(CoreError::from))
            {
                Ok(cached) => {
                    tracing::debug!(tenant, model = %schema.name, "cache hit");
                    if let Some(stats) = &self.stats {
                        stats.record_cache_hit();
                    }
                    return Ok(CacheLookup::Hit(cached));
                }
                Err(err) => {
                    tracing::warn!(tenant, model = %schema.name, error = %err, "discarding undecodable cache entry");
                }
            }
        }
        tracing::debug!(tenant, model = %schema.name, "cache miss");
        if let Some(stats) = &self.stats {
            stats.record_cache_miss();
        }
        Ok(CacheLookup::Miss(CacheTicket {
            key,
            ttl: schema.cache.ttl.or(self.default_ttl),
        }))
    }

    /// Stores a result under the ticket's generation.
    ///
    /// # Errors
    ///
    /// `Storage` if the cache store fails.
    pub fn populate(&self, ticket: CacheTicket, result: &Cached) -> CoreResult<()> {
        let bytes = encode_canonical(&result.to_value());
        self.store.set(&ticket.key, bytes, ticket.ttl)?;
        Ok(())
    }

    /// Orphans every cached result for (tenant, model).
    ///
    /// # Errors
    ///
    /// `Storage` if the cache store fails.
    pub fn invalidate(&self, tenant: &str, model: &str) -> CoreResult<()> {
        let key = generation_key(tenant, model);
        let lock = self.pair_lock(tenant, model);
        let _guard = lock.lock();
        let next = match self.read_generation(&key)? {
            Some(generation) => generation.wrapping_add(1),
            None => rand::random::<u64>(),
        };
        self.write_generation(&key, next)?;
        tracing::debug!(tenant, model, generation = next, "cache invalidated");
        if let Some(stats) = &self.stats {
            stats.record_cache_invalidation();
        }
        Ok(())
    }

    /// Drops every entry and generation.
    ///
    /// # Errors
    ///
    /// `Storage` if the cache store fails.
    pub fn clear(&self) -> CoreResult<()> {
        self.store.clear()?;
        tracing::info!("cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CachePolicy;
    use polystore_storage::InMemoryCacheStore;

    fn layer() -> (Arc<InMemoryCacheStore>, CacheLayer) {
        let store = Arc::new(InMemoryCacheStore::new());
        let layer = CacheLayer::new(store.clone(), Some(Duration::from_secs(60)));
        (store, layer)
    }

    fn users() -> ModelSchema {
        ModelSchema::relational("User", "users").cache(CachePolicy::enabled())
    }

    fn rows(names: &[&str]) -> Cached {
        Cached::Rows(QueryOutput {
            records: names.iter().map(|n| Record::new().with("name", *n)).collect(),
            warnings: vec![QueryWarning::FullScan { model: "User".into() }],
        })
    }

    fn expect_miss(lookup: CacheLookup) -> CacheTicket {
        match lookup {
            CacheLookup::Miss(ticket) => ticket,
            CacheLookup::Hit(hit) => panic!("unexpected hit {hit:?}"),
        }
    }

    #[test]
    fn populate_then_hit() {
        let (_, cache) = layer();
        let spec = QuerySpec::new().eq("name", "Ann");
        let ticket = expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
        assert!(ticket.key().starts_with("pc:t1:User:g"));
        cache.populate(ticket, &rows(&["Ann"])).unwrap();
        assert_eq!(
            cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap(),
            CacheLookup::Hit(rows(&["Ann"]))
        );
    }

    #[test]
    fn tenants_and_kinds_do_not_share_entries() {
        let (_, cache) = layer();
        let spec = QuerySpec::new();
        let ticket = expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
        cache.populate(ticket, &rows(&["Ann"])).unwrap();
        expect_miss(cache.lookup("t2", &users(), CacheKind::Rows, &spec).unwrap());
        expect_miss(cache.lookup("t1", &users(), CacheKind::Count, &spec).unwrap());
    }

    #[test]
    fn late_populate_after_invalidation_is_invisible() {
        let (_, cache) = layer();
        let spec = QuerySpec::new();
        let ticket = expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
        cache.invalidate("t1", "User").unwrap();
        cache.populate(ticket, &rows(&["stale"])).unwrap();
        expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
    }

    #[test]
    fn invalidation_is_scoped_to_tenant_and_model() {
        let (_, cache) = layer();
        let spec = QuerySpec::new();
        let ticket = expect_miss(cache.lookup("t2", &users(), CacheKind::Count, &spec).unwrap());
        cache.populate(ticket, &Cached::Count(3)).unwrap();
        cache.invalidate("t1", "User").unwrap();
        cache.invalidate("t2", "Order").unwrap();
        assert_eq!(
            cache.lookup("t2", &users(), CacheKind::Count, &spec).unwrap(),
            CacheLookup::Hit(Cached::Count(3))
        );
    }

    #[test]
    fn clear_reseeds_generations() {
        let (store, cache) = layer();
        let spec = QuerySpec::new();
        let ticket = expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
        cache.populate(ticket, &rows(&[])).unwrap();
        cache.clear().unwrap();
        assert!(store.is_empty());
        expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
    }

    #[test]
    fn garbage_entry_reads_as_miss() {
        let (store, cache) = layer();
        let spec = QuerySpec::new();
        let ticket = expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
        store.set(ticket.key(), vec![0xff, 0x00], None).unwrap();
        expect_miss(cache.lookup("t1", &users(), CacheKind::Rows, &spec).unwrap());
    }

    #[test]
    fn model_ttl_overrides_default() {
        let (_, cache) = layer();
        let schema = ModelSchema::relational("User", "users").cache(CachePolicy::ttl(Duration::from_secs(5)));
        let ticket = expect_miss(cache.lookup("t1", &schema, CacheKind::Rows, &QuerySpec::new()).unwrap());
        assert_eq!(ticket.ttl, Some(Duration::from_secs(5)));
    }
}
