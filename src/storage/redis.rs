// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend: remote entity cache and the stream store behind the
//! event broker.
//!
//! Cache values are plain strings (`GET`/`SET`/`DEL`). Streams use
//! `XADD`, consumer groups (`XGROUP`, `XREADGROUP`, `XACK`) and `XINFO`
//! for statistics. Blocking reads run on a dedicated connection so they
//! never stall the multiplexed [`ConnectionManager`] used by everything
//! else.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoConsumersReply, StreamInfoGroupsReply, StreamReadReply};
use redis::{cmd, pipe, AsyncCommands, Client, RedisError};
use tracing::debug;

use super::traits::{
    ConsumerInfo, GroupInfo, RemoteCache, StorageError, StreamEntry, StreamStore,
};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

fn backend(e: RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:a1b2c3d4:7")
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// The prefix is prepended to cache keys and stream names, so several
    /// deployments can share one Redis instance.
    ///
    /// ```rust,no_run
    /// # use entity_sync::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("shop:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry_if("redis_connect", &RetryConfig::startup(), |_| true, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            client,
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Drop every key in the selected database. Test helper.
    pub async fn flush_db(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let result: Result<(), RedisError> = cmd("FLUSHDB").query_async(&mut conn).await;
        result.map_err(backend)
    }

    fn convert_reply(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
        let Some(reply) = reply else {
            return Vec::new();
        };
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|stream_id| {
                let fields = stream_id
                    .map
                    .iter()
                    .filter_map(|(name, value)| {
                        redis::from_redis_value::<Vec<u8>>(value)
                            .ok()
                            .map(|bytes| (name.clone(), bytes))
                    })
                    .collect();
                StreamEntry {
                    id: stream_id.id,
                    fields,
                }
            })
            .collect()
    }
}

#[async_trait]
impl RemoteCache for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = conn.get(&key).await.map_err(backend)?;
                Ok(value)
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let result: Result<(), RedisError> = match ttl {
                    Some(ttl) => conn.set_ex(&key, value, ttl.as_secs().max(1)).await,
                    None => conn.set(&key, value).await,
                };
                result.map_err(backend)
            }
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let conn = self.connection.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        retry("redis_del", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let result: Result<(), RedisError> = conn.del(keys).await;
                result.map_err(backend)
            }
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        retry("redis_mget", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let values: Vec<Option<String>> =
                    cmd("MGET").arg(&keys).query_async(&mut conn).await.map_err(backend)?;
                Ok(values)
            }
        })
        .await
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn append(
        &self,
        stream: &str,
        entries: Vec<Vec<(String, Vec<u8>)>>,
    ) -> Result<Vec<String>, StorageError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let stream = self.prefixed_key(stream);

        // Not retried: a lost reply would append the batch twice.
        let mut pipeline = pipe();
        for fields in &entries {
            let mut xadd = cmd("XADD");
            xadd.arg(&stream).arg("*");
            for (name, value) in fields {
                xadd.arg(name).arg(value.as_slice());
            }
            pipeline.add_command(xadd);
        }
        let ids: Vec<String> = pipeline.query_async(&mut conn).await.map_err(backend)?;
        debug!(stream = %stream, count = ids.len(), "Appended stream entries");
        Ok(ids)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let stream = self.prefixed_key(stream);
        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let conn = self.connection.clone();
        let stream = self.prefixed_key(stream);

        let reply = retry("redis_xreadgroup_pending", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let stream = stream.clone();
            async move {
                let reply: Option<StreamReadReply> = cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(group)
                    .arg(consumer)
                    .arg("COUNT")
                    .arg(count)
                    .arg("STREAMS")
                    .arg(&stream)
                    .arg("0")
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                Ok(reply)
            }
        })
        .await?;
        Ok(Self::convert_reply(reply))
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let stream = self.prefixed_key(stream);
        let mut command = cmd("XREADGROUP");
        command.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block) = block {
            command.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        command.arg("STREAMS").arg(&stream).arg(">");

        let reply: Option<StreamReadReply> = if block.is_some() {
            let mut dedicated = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(backend)?;
            command.query_async(&mut dedicated).await.map_err(backend)?
        } else {
            let mut conn = self.connection.clone();
            command.query_async(&mut conn).await.map_err(backend)?
        };
        Ok(Self::convert_reply(reply))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.clone();
        let stream = self.prefixed_key(stream);

        retry("redis_xack", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let stream = stream.clone();
            async move {
                let acked: u64 = cmd("XACK")
                    .arg(&stream)
                    .arg(group)
                    .arg(ids)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                Ok(acked)
            }
        })
        .await
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let stream = self.prefixed_key(stream);
        let _pending: u64 = cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(&stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let stream = self.prefixed_key(stream);
        let len: u64 = cmd("XLEN").arg(&stream).query_async(&mut conn).await.map_err(backend)?;
        Ok(len)
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, StorageError> {
        let mut conn = self.connection.clone();
        let stream = self.prefixed_key(stream);

        let exists: bool = conn.exists(&stream).await.map_err(backend)?;
        if !exists {
            return Ok(Vec::new());
        }
        let reply: StreamInfoGroupsReply = cmd("XINFO")
            .arg("GROUPS")
            .arg(&stream)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut groups = Vec::with_capacity(reply.groups.len());
        for group in reply.groups {
            let consumers: StreamInfoConsumersReply = cmd("XINFO")
                .arg("CONSUMERS")
                .arg(&stream)
                .arg(&group.name)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            groups.push(GroupInfo {
                name: group.name,
                pending: group.pending as u64,
                last_delivered_id: group.last_delivered_id,
                consumers: consumers
                    .consumers
                    .into_iter()
                    .map(|c| ConsumerInfo {
                        name: c.name,
                        pending: c.pending as u64,
                    })
                    .collect(),
            });
        }
        Ok(groups)
    }
}
