// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The engine session object.
//!
//! An [`Engine`] owns one client handle per declared pool, the local cache
//! pools, the cache coordinator and the event broker. It is cheap to clone
//! and every clone shares the same handles. Backends are injected through
//! [`EngineBuilder`] (tests use the in-memory stores) or created from an
//! [`EngineConfig`] by [`Engine::connect`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::broker::{BrokerError, EventBroker};
use crate::cache::{CacheCoordinator, LocalCache};
use crate::config::EngineConfig;
use crate::entity::Entity;
use crate::flush::{FlushError, Flusher};
use crate::registry::{BindError, SchemaError, SchemaRef, ValidatedRegistry, FAKE_DELETE};
use crate::storage::redis::RedisStore;
use crate::storage::sql::SqlStore;
use crate::storage::{RelationalStore, RemoteCache, StorageError, StreamStore};
use crate::value::Value;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("pool '{pool}' failed: {source}")]
    Storage {
        pool: String,
        #[source]
        source: StorageError,
    },
    #[error("pool '{0}' is not configured")]
    MissingPool(String),
    #[error("cached query '{query}' not found in {entity}")]
    UnknownQuery { entity: String, query: String },
    #[error("cached query '{query}' expects {expected} arguments, got {got}")]
    ArgumentCount { query: String, expected: usize, got: usize },
}

/// Payload published by [`Engine::mark_dirty`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyEvent {
    #[serde(rename = "A")]
    pub action: String,
    #[serde(rename = "I")]
    pub id: u64,
    #[serde(rename = "E")]
    pub entity: String,
}

struct EngineInner {
    registry: Arc<ValidatedRegistry>,
    relational: HashMap<String, Arc<dyn RelationalStore>>,
    cache: CacheCoordinator,
    broker: EventBroker,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub struct EngineBuilder {
    registry: Arc<ValidatedRegistry>,
    relational: HashMap<String, Arc<dyn RelationalStore>>,
    remote: HashMap<String, Arc<dyn RemoteCache>>,
    streams: HashMap<String, Arc<dyn StreamStore>>,
    remote_ttl: Option<Duration>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(registry: ValidatedRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            relational: HashMap::new(),
            remote: HashMap::new(),
            streams: HashMap::new(),
            remote_ttl: None,
        }
    }

    #[must_use]
    pub fn with_relational(mut self, pool: &str, store: Arc<dyn RelationalStore>) -> Self {
        self.relational.insert(pool.to_string(), store);
        self
    }

    #[must_use]
    pub fn with_remote_cache(mut self, pool: &str, cache: Arc<dyn RemoteCache>) -> Self {
        self.remote.insert(pool.to_string(), cache);
        self
    }

    #[must_use]
    pub fn with_stream_store(mut self, pool: &str, store: Arc<dyn StreamStore>) -> Self {
        self.streams.insert(pool.to_string(), store);
        self
    }

    #[must_use]
    pub fn with_remote_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.remote_ttl = ttl;
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let local = self
            .registry
            .local_cache_pools()
            .iter()
            .map(|(code, limit)| (code.clone(), Arc::new(LocalCache::new(code, *limit))))
            .collect();
        let cache = CacheCoordinator::new(local, self.remote, self.remote_ttl);
        let broker = EventBroker::new(self.registry.clone(), self.streams);
        Engine {
            inner: Arc::new(EngineInner {
                registry: self.registry,
                relational: self.relational,
                cache,
                broker,
            }),
        }
    }
}

impl Engine {
    #[must_use]
    pub fn builder(registry: ValidatedRegistry) -> EngineBuilder {
        EngineBuilder::new(registry)
    }

    /// Connect every pool the registry declares using `config`.
    pub async fn connect(registry: ValidatedRegistry, config: &EngineConfig) -> Result<Self, EngineError> {
        let mut builder = EngineBuilder::new(registry).with_remote_cache_ttl(config.remote_cache_ttl());
        let mysql_pools: Vec<String> = builder.registry.mysql_pools().iter().cloned().collect();
        for pool in mysql_pools {
            let url = config
                .mysql
                .get(&pool)
                .ok_or_else(|| EngineError::MissingPool(pool.clone()))?;
            let store = SqlStore::new(url).await.map_err(|source| EngineError::Storage {
                pool: pool.clone(),
                source,
            })?;
            info!(pool = %pool, "Relational pool connected");
            builder = builder.with_relational(&pool, Arc::new(store));
        }
        let redis_pools: Vec<String> = builder.registry.redis_pools().iter().cloned().collect();
        for pool in redis_pools {
            let redis = config
                .redis
                .get(&pool)
                .ok_or_else(|| EngineError::MissingPool(pool.clone()))?;
            let store = Arc::new(
                RedisStore::with_prefix(&redis.url, redis.prefix.as_deref())
                    .await
                    .map_err(|source| EngineError::Storage {
                        pool: pool.clone(),
                        source,
                    })?,
            );
            info!(pool = %pool, "Redis pool connected");
            builder = builder
                .with_remote_cache(&pool, store.clone())
                .with_stream_store(&pool, store);
        }
        Ok(builder.build())
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ValidatedRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn relational(&self, pool: &str) -> Option<Arc<dyn RelationalStore>> {
        self.inner.relational.get(pool).cloned()
    }

    #[must_use]
    pub fn local_cache(&self, code: &str) -> Option<Arc<LocalCache>> {
        self.inner.cache.local(code)
    }

    #[must_use]
    pub fn remote_cache(&self, code: &str) -> Option<Arc<dyn RemoteCache>> {
        self.inner.cache.remote(code)
    }

    #[must_use]
    pub fn event_broker(&self) -> &EventBroker {
        &self.inner.broker
    }

    pub(crate) fn cache(&self) -> &CacheCoordinator {
        &self.inner.cache
    }

    fn schema(&self, entity: &str) -> Result<SchemaRef, EngineError> {
        Ok(self.inner.registry.require_schema(entity)?)
    }

    pub fn new_entity(&self, entity: &str) -> Result<Entity, EngineError> {
        Ok(Entity::new(self.schema(entity)?))
    }

    #[must_use]
    pub fn new_flusher<'a>(&self) -> Flusher<'a> {
        Flusher::new(self.clone())
    }

    pub async fn flush(&self, entity: &mut Entity) -> Result<(), FlushError> {
        let mut flusher = self.new_flusher();
        flusher.track(entity);
        flusher.flush().await
    }

    pub async fn flush_many<'a, I>(&self, entities: I) -> Result<(), FlushError>
    where
        I: IntoIterator<Item = &'a mut Entity>,
    {
        let mut flusher = self.new_flusher();
        for entity in entities {
            flusher.track(entity);
        }
        flusher.flush().await
    }

    pub async fn flush_lazy(&self, entity: &mut Entity) -> Result<(), FlushError> {
        let mut flusher = self.new_flusher();
        flusher.track(entity);
        flusher.flush_lazy().await
    }

    pub async fn flush_lazy_many<'a, I>(&self, entities: I) -> Result<(), FlushError>
    where
        I: IntoIterator<Item = &'a mut Entity>,
    {
        let mut flusher = self.new_flusher();
        for entity in entities {
            flusher.track(entity);
        }
        flusher.flush_lazy().await
    }

    /// Soft delete when the entity has `FakeDelete`, otherwise remove the row.
    pub async fn delete(&self, entity: &mut Entity) -> Result<(), FlushError> {
        entity.mark_to_delete();
        self.flush(entity).await
    }

    pub async fn delete_many<'a, I>(&self, entities: I) -> Result<(), FlushError>
    where
        I: IntoIterator<Item = &'a mut Entity>,
    {
        let mut flusher = self.new_flusher();
        for entity in entities {
            entity.mark_to_delete();
            flusher.track(entity);
        }
        flusher.flush().await
    }

    pub async fn delete_lazy(&self, entity: &mut Entity) -> Result<(), FlushError> {
        entity.mark_to_delete();
        self.flush_lazy(entity).await
    }

    /// Remove the row even when the entity supports soft deletion.
    pub async fn force_delete(&self, entity: &mut Entity) -> Result<(), FlushError> {
        entity.force_mark_to_delete();
        self.flush(entity).await
    }

    pub async fn force_delete_many<'a, I>(&self, entities: I) -> Result<(), FlushError>
    where
        I: IntoIterator<Item = &'a mut Entity>,
    {
        let mut flusher = self.new_flusher();
        for entity in entities {
            entity.force_mark_to_delete();
            flusher.track(entity);
        }
        flusher.flush().await
    }

    /// Load one entity, going through the local and remote cache first.
    /// Soft-deleted rows are reported as missing.
    pub async fn load_by_id(&self, entity: &str, id: u64) -> Result<Option<Entity>, EngineError> {
        Ok(self.load_by_ids(entity, &[id]).await?.into_iter().next().flatten())
    }

    pub async fn load_by_ids(&self, entity: &str, ids: &[u64]) -> Result<Vec<Option<Entity>>, EngineError> {
        let schema = self.schema(entity)?;
        let pool = schema.mysql_pool().to_string();
        let store = self
            .relational(&pool)
            .ok_or_else(|| EngineError::MissingPool(pool.clone()))?;
        let columns = schema.load_columns();
        let table = schema.table_name().to_string();
        let rows = self
            .inner
            .cache
            .load_rows(&schema, ids, |id| {
                let store = store.clone();
                let columns = columns.clone();
                let table = table.clone();
                async move { store.load_row(&table, &columns, id).await }
            })
            .await
            .map_err(|source| EngineError::Storage { pool, source })?;

        let fake_delete = schema.column_position(FAKE_DELETE);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = match row {
                Some(row) if fake_delete.is_some_and(|i| matches!(row.get(i), Some(Value::Bool(true)))) => None,
                Some(row) => Some(Entity::from_stored(schema.clone(), &row)?),
                None => None,
            };
            out.push(entity);
        }
        Ok(out)
    }

    /// Drop cached copies of the given rows from every cache tier.
    pub async fn clear_cache_by_ids(&self, entity: &str, ids: &[u64]) -> Result<(), EngineError> {
        let schema = self.schema(entity)?;
        let errors = self.inner.cache.clear_rows(&schema, ids).await;
        debug!(entity = %entity, count = ids.len(), failures = errors.len(), "Cache cleared by ids");
        Ok(())
    }

    /// Identities matching a cached query template, capped at its maximum.
    pub async fn cached_search_ids(&self, entity: &str, query: &str, args: &[Value]) -> Result<Vec<u64>, EngineError> {
        let schema = self.schema(entity)?;
        let template = schema
            .cached_query(query)
            .ok_or_else(|| EngineError::UnknownQuery {
                entity: entity.to_string(),
                query: query.to_string(),
            })?
            .clone();
        let fields: Vec<&str> = template.argument_fields().collect();
        if fields.len() != args.len() {
            return Err(EngineError::ArgumentCount {
                query: query.to_string(),
                expected: fields.len(),
                got: args.len(),
            });
        }
        let mut bound = Vec::with_capacity(args.len());
        for (field, arg) in fields.iter().zip(args) {
            let column = schema.column(field).ok_or_else(|| EngineError::UnknownQuery {
                entity: entity.to_string(),
                query: query.to_string(),
            })?;
            bound.push(column.bind(arg)?);
        }

        let pool = schema.mysql_pool().to_string();
        let store = self
            .relational(&pool)
            .ok_or_else(|| EngineError::MissingPool(pool.clone()))?;
        let table = schema.table_name().to_string();
        let params = bound.clone();
        let clause = template.clause.clone();
        let max = template.max;
        self.inner
            .cache
            .search_ids(&schema, &template, &bound, || async move {
                store.search_ids(&table, &clause, &params, max).await
            })
            .await
            .map_err(|source| EngineError::Storage { pool, source })
    }

    pub async fn cached_search(&self, entity: &str, query: &str, args: &[Value]) -> Result<Vec<Entity>, EngineError> {
        let ids = self.cached_search_ids(entity, query, args).await?;
        Ok(self.load_by_ids(entity, &ids).await?.into_iter().flatten().collect())
    }

    pub async fn cached_search_one(&self, entity: &str, query: &str, args: &[Value]) -> Result<Option<Entity>, EngineError> {
        let ids = self.cached_search_ids(entity, query, args).await?;
        match ids.first() {
            Some(id) => self.load_by_id(entity, *id).await,
            None => Ok(None),
        }
    }

    /// Publish a dirty marker for each id, for consumers that rebuild
    /// derived data.
    pub async fn mark_dirty(&self, entity: &str, stream: &str, ids: &[u64]) -> Result<(), EngineError> {
        self.schema(entity)?;
        let mut flusher = self.inner.broker.new_flusher();
        for id in ids {
            flusher.publish(
                stream,
                &DirtyEvent {
                    action: "u".to_string(),
                    id: *id,
                    entity: entity.to_string(),
                },
            )?;
        }
        flusher.flush().await?;
        Ok(())
    }
}
