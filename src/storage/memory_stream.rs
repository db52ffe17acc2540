//! In-memory stream store with Redis Streams consumer-group semantics.
//!
//! Entries get `<millis>-<seq>` ids in append order. Each group tracks how
//! far it has delivered and which entries each consumer still owns.
//! Blocking reads park on a [`Notify`] that every append wakes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::traits::{ConsumerInfo, GroupInfo, StorageError, StreamEntry, StreamStore};

#[derive(Default)]
struct GroupState {
    /// Number of entries handed out so far (index of the next new entry).
    delivered: usize,
    /// Entry index → owning consumer.
    pending: BTreeMap<usize, String>,
    consumers: BTreeSet<String>,
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<StreamEntry>,
    index: HashMap<String, usize>,
    groups: BTreeMap<String, GroupState>,
    last_millis: u64,
    seq: u64,
}

impl StreamLog {
    fn next_id(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if now > self.last_millis {
            self.last_millis = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        format!("{}-{}", self.last_millis, self.seq)
    }
}

pub struct InMemoryStreamStore {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
}

impl InMemoryStreamStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    fn no_group(stream: &str, group: &str) -> StorageError {
        StorageError::Backend(format!(
            "NOGROUP No such key '{stream}' or consumer group '{group}' in XREADGROUP"
        ))
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut streams = self.streams.lock();
        let log = streams.get_mut(stream).ok_or_else(|| Self::no_group(stream, group))?;
        let state = log.groups.get_mut(group).ok_or_else(|| Self::no_group(stream, group))?;
        state.consumers.insert(consumer.to_string());

        let start = state.delivered;
        let end = (start + count).min(log.entries.len());
        for idx in start..end {
            state.pending.insert(idx, consumer.to_string());
        }
        state.delivered = end;
        Ok(log.entries[start..end].to_vec())
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn append(
        &self,
        stream: &str,
        entries: Vec<Vec<(String, Vec<u8>)>>,
    ) -> Result<Vec<String>, StorageError> {
        let ids = {
            let mut streams = self.streams.lock();
            let log = streams.entry(stream.to_string()).or_default();
            let mut ids = Vec::with_capacity(entries.len());
            for fields in entries {
                let id = log.next_id();
                log.index.insert(id.clone(), log.entries.len());
                log.entries.push(StreamEntry { id: id.clone(), fields });
                ids.push(id);
            }
            ids
        };
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let mut streams = self.streams.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut streams = self.streams.lock();
        let log = streams.get_mut(stream).ok_or_else(|| Self::no_group(stream, group))?;
        let state = log.groups.get_mut(group).ok_or_else(|| Self::no_group(stream, group))?;
        state.consumers.insert(consumer.to_string());
        Ok(state
            .pending
            .iter()
            .filter(|(_, owner)| owner.as_str() == consumer)
            .take(count)
            .map(|(idx, _)| log.entries[*idx].clone())
            .collect())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.take_new(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StorageError> {
        let mut streams = self.streams.lock();
        let Some(log) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(state) = log.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if let Some(idx) = log.index.get(id) {
                if state.pending.remove(idx).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<(), StorageError> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream).and_then(|log| log.groups.get_mut(group)) {
            state.consumers.remove(consumer);
            state.pending.retain(|_, owner| owner != consumer);
        }
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<u64, StorageError> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map_or(0, |log| log.entries.len() as u64))
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, StorageError> {
        let streams = self.streams.lock();
        let Some(log) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(log
            .groups
            .iter()
            .map(|(name, state)| GroupInfo {
                name: name.clone(),
                pending: state.pending.len() as u64,
                last_delivered_id: state
                    .delivered
                    .checked_sub(1)
                    .map_or_else(|| "0-0".to_string(), |idx| log.entries[idx].id.clone()),
                consumers: state
                    .consumers
                    .iter()
                    .map(|consumer| ConsumerInfo {
                        name: consumer.clone(),
                        pending: state.pending.values().filter(|o| *o == consumer).count() as u64,
                    })
                    .collect(),
            })
            .collect())
    }
}
