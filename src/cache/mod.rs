// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache Consistency Coordinator.
//!
//! Committed writes are turned into an [`Invalidation`] set: the entity's
//! row key plus every cached query result key whose tracked columns the
//! write touched, for both the old and the new argument tuple. Keys are
//! removed, never rewritten; the next reader repopulates them through
//! cache-aside loading.
//!
//! Local pools are invalidated synchronously under their own lock. Remote
//! pools are best effort: failures are logged, counted and handed back as
//! [`CacheError`]s, but never fail the write that caused them.

pub mod local;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub use local::LocalCache;

use crate::flush::{EntitySqlFlush, FlushAction};
use crate::metrics;
use crate::registry::{CachedQuery, TableSchema};
use crate::storage::{RemoteCache, StorageError};
use crate::value::Value;

/// Negative marker for rows known not to exist.
const MISSING: &str = "null";

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("remote cache pool '{pool}' failed during {operation}: {source}")]
    Remote {
        pool: String,
        operation: &'static str,
        #[source]
        source: StorageError,
    },
}

/// Keys to drop, grouped by cache pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    pub local: BTreeMap<String, BTreeSet<String>>,
    pub remote: BTreeMap<String, BTreeSet<String>>,
}

impl Invalidation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local.values().all(BTreeSet::is_empty) && self.remote.values().all(BTreeSet::is_empty)
    }

    fn add(&mut self, schema: &TableSchema, key: String) {
        if let Some(pool) = schema.local_cache_pool() {
            self.local.entry(pool.to_string()).or_default().insert(key.clone());
        }
        if let Some(pool) = schema.redis_cache_pool() {
            self.remote.entry(pool.to_string()).or_default().insert(key);
        }
    }

    /// Collect the keys a committed record makes stale.
    pub fn collect(&mut self, schema: &TableSchema, record: &EntitySqlFlush) {
        if schema.local_cache_pool().is_none() && schema.redis_cache_pool().is_none() {
            return;
        }
        self.add(schema, schema.cache_key(record.id));

        let before = record.row_before(schema);
        let after = (record.action != FlushAction::Delete).then(|| record.row_after(schema));
        for query in schema.cached_queries().values() {
            let affected = match record.action {
                FlushAction::Insert | FlushAction::Delete => true,
                FlushAction::Update => record.update.keys().any(|c| query.tracked_fields.contains(c)),
            };
            if !affected {
                continue;
            }
            for row in before.iter().chain(after.iter()) {
                self.add(schema, query_key(schema, query, row));
            }
        }
    }
}

fn query_key(schema: &TableSchema, query: &CachedQuery, row: &[Value]) -> String {
    schema.query_cache_key(&query.name, &schema.query_args(query, row))
}

pub struct CacheCoordinator {
    local: HashMap<String, Arc<LocalCache>>,
    remote: HashMap<String, Arc<dyn RemoteCache>>,
    remote_ttl: Option<Duration>,
}

impl CacheCoordinator {
    #[must_use]
    pub fn new(
        local: HashMap<String, Arc<LocalCache>>,
        remote: HashMap<String, Arc<dyn RemoteCache>>,
        remote_ttl: Option<Duration>,
    ) -> Self {
        Self {
            local,
            remote,
            remote_ttl,
        }
    }

    #[must_use]
    pub fn local(&self, pool: &str) -> Option<Arc<LocalCache>> {
        self.local.get(pool).cloned()
    }

    #[must_use]
    pub fn remote(&self, pool: &str) -> Option<Arc<dyn RemoteCache>> {
        self.remote.get(pool).cloned()
    }

    fn local_for(&self, schema: &TableSchema) -> Option<&Arc<LocalCache>> {
        schema.local_cache_pool().and_then(|p| self.local.get(p))
    }

    fn remote_for<'a>(&'a self, schema: &'a TableSchema) -> Option<(&'a str, &'a Arc<dyn RemoteCache>)> {
        schema
            .redis_cache_pool()
            .and_then(|p| self.remote.get(p).map(|c| (p, c)))
    }

    /// Drop local keys. Synchronous and process-local.
    pub fn apply_local(&self, invalidation: &Invalidation) {
        for (pool, keys) in &invalidation.local {
            if let Some(cache) = self.local.get(pool) {
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                cache.remove(&keys);
                metrics::record_invalidations("local", keys.len());
            }
        }
    }

    /// Drop remote keys, one round trip per pool.
    pub async fn flush_remote(&self, invalidation: &Invalidation) -> Vec<CacheError> {
        let mut errors = Vec::new();
        for (pool, keys) in &invalidation.remote {
            let Some(cache) = self.remote.get(pool) else {
                continue;
            };
            let keys: Vec<String> = keys.iter().cloned().collect();
            match cache.del(&keys).await {
                Ok(()) => {
                    metrics::record_invalidations("remote", keys.len());
                    debug!(pool = %pool, count = keys.len(), "Remote cache keys invalidated");
                }
                Err(e) => {
                    warn!(pool = %pool, count = keys.len(), error = %e, "Remote cache invalidation failed");
                    metrics::record_cache_error(pool, "del");
                    errors.push(CacheError::Remote {
                        pool: pool.clone(),
                        operation: "del",
                        source: e,
                    });
                }
            }
        }
        errors
    }

    pub async fn invalidate(&self, invalidation: &Invalidation) -> Vec<CacheError> {
        self.apply_local(invalidation);
        self.flush_remote(invalidation).await
    }

    async fn remote_set(&self, pool: &str, cache: &Arc<dyn RemoteCache>, key: &str, value: &str) {
        if let Err(e) = cache.set(key, value, self.remote_ttl).await {
            warn!(pool = %pool, key = %key, error = %e, "Remote cache set failed");
            metrics::record_cache_error(pool, "set");
        }
    }

    /// Cache-aside lookup of stored rows: local, then remote, then `loader`.
    /// Misses found by the loader are cached as negative entries.
    pub async fn load_rows<F, Fut>(
        &self,
        schema: &TableSchema,
        ids: &[u64],
        loader: F,
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<Option<Vec<Value>>, StorageError>>,
    {
        let mut results: Vec<Option<Option<Vec<Value>>>> = vec![None; ids.len()];
        let local = self.local_for(schema);

        if let Some(cache) = local {
            for (slot, id) in results.iter_mut().zip(ids) {
                if let Some(json) = cache.get(&schema.cache_key(*id)) {
                    *slot = decode_row(&json);
                }
            }
        }

        let remote = self.remote_for(schema);
        if let Some((pool, cache)) = remote {
            let missing: Vec<usize> = (0..ids.len()).filter(|i| results[*i].is_none()).collect();
            if !missing.is_empty() {
                let keys: Vec<String> = missing.iter().map(|i| schema.cache_key(ids[*i])).collect();
                match cache.mget(&keys).await {
                    Ok(values) => {
                        for ((index, key), raw) in missing.iter().zip(&keys).zip(values) {
                            let decoded: Option<serde_json::Value> =
                                raw.and_then(|raw| serde_json::from_str(&raw).ok());
                            metrics::record_remote_cache_lookup(pool, decoded.is_some());
                            if let Some(json) = decoded {
                                if let Some(local) = local {
                                    local.set(key, json.clone());
                                }
                                results[*index] = decode_row(&json);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(pool = %pool, error = %e, "Remote cache read failed, falling back to storage");
                        metrics::record_cache_error(pool, "mget");
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        for (slot, id) in results.into_iter().zip(ids) {
            let row = match slot {
                Some(row) => row,
                None => {
                    let row = loader(*id).await?;
                    let json = match &row {
                        Some(values) => serde_json::to_value(values).unwrap_or(serde_json::Value::Null),
                        None => serde_json::Value::Null,
                    };
                    let key = schema.cache_key(*id);
                    if let Some(cache) = local {
                        cache.set(&key, json.clone());
                    }
                    if let Some((pool, cache)) = remote {
                        let raw = if json.is_null() { MISSING.to_string() } else { json.to_string() };
                        self.remote_set(pool, cache, &key, &raw).await;
                    }
                    row
                }
            };
            out.push(row);
        }
        Ok(out)
    }

    /// Cache-aside lookup of a query template's matching identities.
    pub async fn search_ids<F, Fut>(
        &self,
        schema: &TableSchema,
        query: &CachedQuery,
        args: &[Value],
        loader: F,
    ) -> Result<Vec<u64>, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u64>, StorageError>>,
    {
        let key = schema.query_cache_key(&query.name, args);
        let local = self.local_for(schema);
        if let Some(ids) = local
            .and_then(|cache| cache.get(&key))
            .and_then(|json| serde_json::from_value::<Vec<u64>>(json).ok())
        {
            return Ok(ids);
        }
        let remote = self.remote_for(schema);
        if let Some((pool, cache)) = remote {
            match cache.get(&key).await {
                Ok(raw) => {
                    let ids = raw.and_then(|raw| serde_json::from_str::<Vec<u64>>(&raw).ok());
                    metrics::record_remote_cache_lookup(pool, ids.is_some());
                    if let Some(ids) = ids {
                        if let Some(local) = local {
                            local.set(&key, serde_json::Value::from(ids.clone()));
                        }
                        return Ok(ids);
                    }
                }
                Err(e) => {
                    warn!(pool = %pool, error = %e, "Remote cache read failed, falling back to storage");
                    metrics::record_cache_error(pool, "get");
                }
            }
        }

        let ids = loader().await?;
        if let Some(cache) = local {
            cache.set(&key, serde_json::Value::from(ids.clone()));
        }
        if let Some((pool, cache)) = remote {
            let raw = serde_json::Value::from(ids.clone()).to_string();
            self.remote_set(pool, cache, &key, &raw).await;
        }
        Ok(ids)
    }

    /// Drop cached rows for the given identities.
    pub async fn clear_rows(&self, schema: &TableSchema, ids: &[u64]) -> Vec<CacheError> {
        let mut invalidation = Invalidation::default();
        for id in ids {
            invalidation.add(schema, schema.cache_key(*id));
        }
        self.invalidate(&invalidation).await
    }
}

/// `Some(None)` for a negative entry, `None` for an undecodable one.
fn decode_row(json: &serde_json::Value) -> Option<Option<Vec<Value>>> {
    if json.is_null() {
        return Some(None);
    }
    serde_json::from_value::<Vec<Value>>(json.clone()).ok().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::build_flush;
    use crate::entity::Entity;
    use crate::registry::{EntityDefinition, FieldType, IntSize, Registry, SchemaRef};
    use crate::storage::memory::InMemoryCache;

    fn schema() -> SchemaRef {
        let mut registry = Registry::new();
        registry
            .register_mysql_pool("default")
            .register_local_cache("default", 100)
            .register_redis("default")
            .register_entity(
                EntityDefinition::new("User")
                    .tags("localCache;redisCache")
                    .field("Name", FieldType::String, "")
                    .field("Age", FieldType::Uint(IntSize::Bits8), "index=Age")
                    .query("ByAge", ":Age = ?"),
            );
        registry.validate().unwrap().table_schema("User").unwrap()
    }

    fn coordinator() -> (CacheCoordinator, Arc<InMemoryCache>) {
        let remote = Arc::new(InMemoryCache::new());
        let mut remotes: HashMap<String, Arc<dyn RemoteCache>> = HashMap::new();
        remotes.insert("default".into(), remote.clone());
        let mut locals = HashMap::new();
        locals.insert("default".into(), Arc::new(LocalCache::new("default", 100)));
        (CacheCoordinator::new(locals, remotes, None), remote)
    }

    #[tokio::test]
    async fn test_load_rows_populates_both_tiers() {
        let schema = schema();
        let (cache, remote) = coordinator();
        let row = vec![Value::Uint(1), Value::Uint(20), Value::from("a")];
        let loaded = cache
            .load_rows(&schema, &[1, 2], |id| {
                let row = row.clone();
                async move { Ok(if id == 1 { Some(row) } else { None }) }
            })
            .await
            .unwrap();
        assert_eq!(loaded, vec![Some(row.clone()), None]);
        assert!(remote.contains_key(&schema.cache_key(1)));
        assert_eq!(remote.get(&schema.cache_key(2)).await.unwrap().as_deref(), Some("null"));

        // Second read is served from cache; the loader would fail.
        let again = cache
            .load_rows(&schema, &[1, 2], |_| async { Err(StorageError::Backend("down".into())) })
            .await
            .unwrap();
        assert_eq!(again, vec![Some(row), None]);
    }

    #[tokio::test]
    async fn test_update_of_tracked_column_invalidates_both_tuples() {
        let schema = schema();
        let mut stored = schema.default_row();
        stored[0] = Value::Uint(5);
        stored[schema.column_position("Age").unwrap()] = Value::Uint(20);
        let mut user = Entity::from_stored(schema.clone(), &stored).unwrap();
        user.set("Age", 21u8).unwrap();
        let record = build_flush(&user).unwrap().unwrap();

        let mut invalidation = Invalidation::default();
        invalidation.collect(&schema, &record);
        let keys = &invalidation.local["default"];
        assert!(keys.contains(&schema.cache_key(5)));
        assert!(keys.contains(&schema.query_cache_key("ByAge", &[Value::Uint(20)])));
        assert!(keys.contains(&schema.query_cache_key("ByAge", &[Value::Uint(21)])));
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_untracked_update_keeps_query_results() {
        let schema = schema();
        let mut stored = schema.default_row();
        stored[0] = Value::Uint(5);
        let mut user = Entity::from_stored(schema.clone(), &stored).unwrap();
        user.set("Name", "b").unwrap();
        let record = build_flush(&user).unwrap().unwrap();

        let mut invalidation = Invalidation::default();
        invalidation.collect(&schema, &record);
        assert_eq!(invalidation.remote["default"].len(), 1);
    }

    #[tokio::test]
    async fn test_search_ids_cached() {
        let schema = schema();
        let (cache, _) = coordinator();
        let query = schema.cached_query("ByAge").unwrap().clone();
        let ids = cache
            .search_ids(&schema, &query, &[Value::Uint(20)], || async { Ok(vec![1, 2]) })
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        let cached = cache
            .search_ids(&schema, &query, &[Value::Uint(20)], || async { Ok(vec![]) })
            .await
            .unwrap();
        assert_eq!(cached, vec![1, 2]);
    }
}
