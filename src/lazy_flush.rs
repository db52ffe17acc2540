// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lazy Flush Consumer.
//!
//! Replays flush records queued by [`Flusher::flush_lazy`](crate::flush::Flusher::flush_lazy)
//! against the relational store.
//!
//! ```text
//!            ┌──────────── Database error ────────────┐
//!            │                                        ▼
//!   ┌────────┴───────┐                     ┌────────────────────┐
//!   │     Batch      │                     │  Isolated replay   │
//!   │ all records as │                     │ one event, one     │
//!   │ one unit, ack  │                     │ record at a time,  │
//!   │ whole batch    │                     │ resolvers on error │
//!   └────────────────┘                     └────────────────────┘
//! ```
//!
//! An event whose record fails in isolation and that no resolver accepts
//! stays unacknowledged and the digest call fails, so the consumer is
//! restarted and the event is delivered again.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Event, EventHandler, HandlerError};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::flush::{EntitySqlFlush, FlushError};
use crate::metrics;
use crate::registry::{SchemaRef, LAZY_FLUSH_GROUP};
use crate::storage::StorageError;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(30);
/// One replaying consumer per group, so a restart reads the entries an
/// earlier run left unacknowledged.
pub const DEFAULT_CONSUMER_NAME: &str = "orm-lazy-flush-consumer-1";

#[derive(Error, Debug)]
pub enum LazyFlushError {
    #[error("lazy flush of {entity} {id} failed and no resolver accepted it: {source}")]
    Unresolved {
        entity: String,
        id: u64,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Broker(BrokerError),
}

impl From<BrokerError> for LazyFlushError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Handler(inner) => match inner.downcast::<LazyFlushError>() {
                Ok(lazy) => *lazy,
                Err(other) => LazyFlushError::Broker(BrokerError::Handler(other)),
            },
            other => LazyFlushError::Broker(other),
        }
    }
}

/// Last resort for a record the relational store keeps rejecting.
///
/// Returning `Ok` marks the record as handled and its event is acknowledged.
#[async_trait]
pub trait LazyFlushErrorResolver: Send + Sync {
    async fn resolve(&self, engine: &Engine, record: &EntitySqlFlush, error: &StorageError) -> Result<(), HandlerError>;
}

pub struct LazyFlushConsumer {
    engine: Engine,
    resolvers: Vec<Box<dyn LazyFlushErrorResolver>>,
    batch_size: usize,
    block: Option<Duration>,
    name: String,
}

impl LazyFlushConsumer {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            resolvers: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            block: Some(DEFAULT_BLOCK_TIME),
            name: DEFAULT_CONSUMER_NAME.to_string(),
        }
    }

    /// Consumer tuned by `lazy_flush_batch_size` and `lazy_flush_block_ms`.
    /// A block time of zero disables blocking.
    #[must_use]
    pub fn from_config(engine: Engine, config: &EngineConfig) -> Self {
        let mut consumer = Self::new(engine);
        consumer.set_batch_size(config.lazy_flush_batch_size);
        match config.lazy_flush_block_ms {
            0 => consumer.disable_block_mode(),
            _ => consumer.set_block_time(config.lazy_flush_block_time()),
        };
        consumer
    }

    /// Resolvers are consulted in registration order.
    pub fn register_error_resolver(&mut self, resolver: impl LazyFlushErrorResolver + 'static) -> &mut Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> &mut Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn set_block_time(&mut self, block: Duration) -> &mut Self {
        self.block = Some(block);
        self
    }

    pub fn disable_block_mode(&mut self) -> &mut Self {
        self.block = None;
        self
    }

    /// Only needed when several replaying processes share the group.
    pub fn set_name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_string();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn block_time(&self) -> Option<Duration> {
        self.block
    }

    /// Replay one batch. Returns `Ok(false)` when nothing arrived before the
    /// block time elapsed or `shutdown` fired.
    pub async fn digest(&self, shutdown: watch::Receiver<bool>) -> Result<bool, LazyFlushError> {
        let mut consumer = self.engine.event_broker().consumer(LAZY_FLUSH_GROUP)?;
        match self.block {
            Some(block) => consumer.set_block_time(block),
            None => consumer.disable_block_mode(),
        }
        consumer.set_name(&self.name);
        Ok(consumer.consume(shutdown, self.batch_size, self).await?)
    }

    /// Digest until `shutdown` fires or a batch fails.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), LazyFlushError> {
        info!(group = LAZY_FLUSH_GROUP, batch_size = self.batch_size, "Lazy flush consumer started");
        while !*shutdown.borrow() {
            self.digest(shutdown.clone()).await?;
        }
        info!(group = LAZY_FLUSH_GROUP, "Lazy flush consumer stopped");
        Ok(())
    }

    fn schemas(&self, records: Vec<EntitySqlFlush>) -> Result<Vec<(SchemaRef, EntitySqlFlush)>, FlushError> {
        records
            .into_iter()
            .map(|record| {
                let schema = self
                    .engine
                    .registry()
                    .table_schema(&record.entity)
                    .ok_or_else(|| FlushError::UnknownEntity(record.entity.clone()))?;
                Ok((schema, record))
            })
            .collect()
    }

    async fn replay_isolated(&self, events: &[Event], batches: Vec<Vec<EntitySqlFlush>>) -> Result<(), LazyFlushError> {
        metrics::record_isolated_replay();
        warn!(events = events.len(), "Lazy flush batch rejected, replaying records one at a time");
        for (event, records) in events.iter().zip(batches) {
            for (schema, record) in self.schemas(records)? {
                let error = match self.engine.execute_flushes(vec![(schema, record.clone())]).await {
                    Ok(_) => continue,
                    Err(err) if err.is_database() => match err.storage_error() {
                        Some(source) => source.clone(),
                        None => return Err(err.into()),
                    },
                    Err(err) => return Err(err.into()),
                };
                if !self.resolve(&record, &error).await {
                    error!(
                        event = %event.id(),
                        entity = %record.entity,
                        id = record.id,
                        error = %error,
                        "Lazy flush record unresolved"
                    );
                    return Err(LazyFlushError::Unresolved {
                        entity: record.entity,
                        id: record.id,
                        source: error,
                    });
                }
            }
            event.ack();
        }
        Ok(())
    }

    async fn resolve(&self, record: &EntitySqlFlush, error: &StorageError) -> bool {
        for resolver in &self.resolvers {
            match resolver.resolve(&self.engine, record, error).await {
                Ok(()) => {
                    metrics::record_resolver_outcome(true);
                    debug!(entity = %record.entity, id = record.id, "Lazy flush error resolved");
                    return true;
                }
                Err(declined) => {
                    debug!(entity = %record.entity, id = record.id, reason = %declined, "Resolver declined");
                }
            }
        }
        metrics::record_resolver_outcome(false);
        false
    }

    async fn replay(&self, events: &[Event]) -> Result<(), LazyFlushError> {
        let mut batches = Vec::with_capacity(events.len());
        for event in events {
            batches.push(event.deserialize::<Vec<EntitySqlFlush>>()?);
        }
        let records = self.schemas(batches.iter().flatten().cloned().collect())?;
        let count = records.len();
        match self.engine.execute_flushes(records).await {
            Ok(_) => {
                debug!(events = events.len(), records = count, "Lazy flush batch replayed");
                Ok(())
            }
            Err(err) if err.is_database() => self.replay_isolated(events, batches).await,
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl EventHandler for LazyFlushConsumer {
    async fn handle(&self, events: &[Event]) -> Result<(), HandlerError> {
        self.replay(events).await.map_err(|e| Box::new(e) as HandlerError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_is_unwrapped() {
        let inner = LazyFlushError::Unresolved {
            entity: "User".into(),
            id: 1,
            source: StorageError::Database {
                code: Some("1062".into()),
                message: "Duplicate entry".into(),
            },
        };
        let wrapped = BrokerError::Handler(Box::new(inner));
        assert!(matches!(
            LazyFlushError::from(wrapped),
            LazyFlushError::Unresolved { id: 1, .. }
        ));

        let other = BrokerError::Handler("boom".into());
        assert!(matches!(LazyFlushError::from(other), LazyFlushError::Broker(_)));
    }
}
