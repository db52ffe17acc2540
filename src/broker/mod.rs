//! Event Broker.
//!
//! Durable, ordered streams with consumer groups, backed by a
//! [`StreamStore`] per Redis pool. Streams and their groups are declared on
//! the registry; a group always reads the one stream it was registered
//! with.
//!
//! ```text
//! publish ──► [stream: e1 e2 e3 ...] ──► group A: consumer 1, consumer 2
//!                                    └──► group B: consumer 1
//! ```

pub mod consumer;
pub mod event;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub use consumer::{handler_fn, EventHandler, EventsConsumer, HandlerError, HandlerFn};
pub use event::{Event, EventMeta};

use crate::metrics;
use crate::registry::{StreamDefinition, ValidatedRegistry};
use crate::storage::{StorageError, StreamStore};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("stream store error: {0}")]
    Storage(#[from] StorageError),
    #[error("stream '{0}' is not registered")]
    UnknownStream(String),
    #[error("consumer group '{0}' is not registered")]
    UnknownGroup(String),
    #[error("no stream store for redis pool '{0}'")]
    MissingStore(String),
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("failed to decode event {id}: {reason}")]
    Decode { id: String, reason: String },
    #[error("event handler failed: {0}")]
    Handler(#[source] HandlerError),
    #[error("event handler panicked: {0}")]
    HandlerPanicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatistics {
    pub name: String,
    pub pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatistics {
    pub group: String,
    pub pending: u64,
    pub last_delivered_id: String,
    pub consumers: Vec<ConsumerStatistics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatistics {
    pub stream: String,
    pub redis_pool: String,
    pub len: u64,
    pub groups: Vec<GroupStatistics>,
}

pub struct EventBroker {
    registry: Arc<ValidatedRegistry>,
    stores: HashMap<String, Arc<dyn StreamStore>>,
}

impl EventBroker {
    #[must_use]
    pub fn new(registry: Arc<ValidatedRegistry>, stores: HashMap<String, Arc<dyn StreamStore>>) -> Self {
        Self { registry, stores }
    }

    fn resolve(&self, stream: &str) -> Result<(&StreamDefinition, Arc<dyn StreamStore>), BrokerError> {
        let definition = self
            .registry
            .stream(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;
        let store = self
            .stores
            .get(&definition.redis_pool)
            .cloned()
            .ok_or_else(|| BrokerError::MissingStore(definition.redis_pool.clone()))?;
        Ok((definition, store))
    }

    fn meta() -> EventMeta {
        EventMeta {
            published_at: Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Append one event, returning its delivery id.
    pub async fn publish<T: Serialize + ?Sized>(&self, stream: &str, payload: &T) -> Result<String, BrokerError> {
        let (_, store) = self.resolve(stream)?;
        let fields = event::encode(payload, &Self::meta())?;
        let ids = store.append(stream, vec![fields]).await?;
        metrics::record_publish(stream, 1);
        ids.into_iter()
            .next()
            .ok_or_else(|| BrokerError::Storage(StorageError::Backend("append returned no id".into())))
    }

    /// Buffer events and append them with one round trip per stream.
    #[must_use]
    pub fn new_flusher(&self) -> EventFlusher<'_> {
        EventFlusher {
            broker: self,
            pending: Vec::new(),
        }
    }

    pub fn consumer(&self, group: &str) -> Result<EventsConsumer, BrokerError> {
        let definition = self
            .registry
            .stream_for_group(group)
            .ok_or_else(|| BrokerError::UnknownGroup(group.to_string()))?;
        let (_, store) = self.resolve(&definition.name)?;
        Ok(EventsConsumer::new(store, &definition.name, group))
    }

    pub async fn stream_statistics(&self, streams: &[&str]) -> Result<Vec<StreamStatistics>, BrokerError> {
        let mut out = Vec::with_capacity(streams.len());
        for stream in streams {
            let (definition, store) = self.resolve(stream)?;
            let len = store.len(stream).await?;
            let groups = store
                .groups(stream)
                .await?
                .into_iter()
                .map(|group| {
                    metrics::set_pending(&group.name, group.pending);
                    GroupStatistics {
                        group: group.name,
                        pending: group.pending,
                        last_delivered_id: group.last_delivered_id,
                        consumers: group
                            .consumers
                            .into_iter()
                            .map(|c| ConsumerStatistics {
                                name: c.name,
                                pending: c.pending,
                            })
                            .collect(),
                    }
                })
                .collect();
            out.push(StreamStatistics {
                stream: stream.to_string(),
                redis_pool: definition.redis_pool.clone(),
                len,
                groups,
            });
        }
        Ok(out)
    }

    /// Statistics for every registered stream.
    pub async fn streams_statistics(&self) -> Result<Vec<StreamStatistics>, BrokerError> {
        let names: Vec<&str> = self.registry.streams().keys().map(String::as_str).collect();
        self.stream_statistics(&names).await
    }
}

/// Buffered publisher from [`EventBroker::new_flusher`].
pub struct EventFlusher<'a> {
    broker: &'a EventBroker,
    pending: Vec<(String, Vec<(String, Vec<u8>)>)>,
}

impl EventFlusher<'_> {
    pub fn publish<T: Serialize + ?Sized>(&mut self, stream: &str, payload: &T) -> Result<(), BrokerError> {
        self.broker.resolve(stream)?;
        let fields = event::encode(payload, &EventBroker::meta())?;
        self.pending.push((stream.to_string(), fields));
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append buffered events, grouped per stream in first-publish order.
    ///
    /// Events of a stream leave the buffer only once their append succeeded,
    /// so a failed flush can be retried without losing the rest.
    pub async fn flush(&mut self) -> Result<Vec<String>, BrokerError> {
        let mut order: Vec<String> = Vec::new();
        for (stream, _) in &self.pending {
            if !order.contains(stream) {
                order.push(stream.clone());
            }
        }
        let mut ids = Vec::new();
        for stream in order {
            let entries: Vec<Vec<(String, Vec<u8>)>> = self
                .pending
                .iter()
                .filter(|(s, _)| *s == stream)
                .map(|(_, fields)| fields.clone())
                .collect();
            let count = entries.len();
            let (_, store) = self.broker.resolve(&stream)?;
            ids.extend(store.append(&stream, entries).await?);
            self.pending.retain(|(s, _)| *s != stream);
            metrics::record_publish(&stream, count);
            debug!(stream = %stream, count, "Flushed buffered events");
        }
        Ok(ids)
    }
}
