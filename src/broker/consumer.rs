// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer-group readers.
//!
//! One [`EventsConsumer::consume`] call handles at most one batch: the
//! consumer's own unacknowledged entries first (a batch a crashed or failed
//! run left behind), otherwise new entries, waiting up to the block time
//! when there are none. The batch is acknowledged only when the handler
//! returns cleanly; on error or panic only the events the handler marked
//! with [`Event::ack`] are.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::event::Event;
use super::BrokerError;
use crate::metrics;
use crate::storage::{StreamEntry, StreamStore};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(30);

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, events: &[Event]) -> Result<(), HandlerError>;
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&[Event]) -> Result<(), HandlerError> + Send + Sync,
{
    HandlerFn(f)
}

#[async_trait]
impl<F> EventHandler for HandlerFn<F>
where
    F: Fn(&[Event]) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, events: &[Event]) -> Result<(), HandlerError> {
        (self.0)(events)
    }
}

pub struct EventsConsumer {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    name: String,
    block: Option<Duration>,
    group_ready: AtomicBool,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl EventsConsumer {
    pub(crate) fn new(store: Arc<dyn StreamStore>, stream: &str, group: &str) -> Self {
        Self {
            store,
            stream: stream.to_string(),
            group: group.to_string(),
            name: format!("consumer-{}", uuid::Uuid::new_v4().simple()),
            block: Some(DEFAULT_BLOCK_TIME),
            group_ready: AtomicBool::new(false),
        }
    }

    /// Return immediately when there is nothing to read.
    pub fn disable_block_mode(&mut self) {
        self.block = None;
    }

    pub fn set_block_time(&mut self, block: Duration) {
        self.block = Some(block);
    }

    /// Consumer name within the group; stable names let a restarted
    /// process pick up its own pending entries.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn ensure_group(&self) -> Result<(), BrokerError> {
        if !self.group_ready.load(Ordering::Acquire) {
            self.store.create_group(&self.stream, &self.group).await?;
            self.group_ready.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn read(&self, shutdown: &mut watch::Receiver<bool>, count: usize) -> Result<(Vec<StreamEntry>, bool), BrokerError> {
        let pending = self
            .store
            .read_pending(&self.stream, &self.group, &self.name, count)
            .await?;
        if !pending.is_empty() {
            return Ok((pending, true));
        }
        let read = self
            .store
            .read_new(&self.stream, &self.group, &self.name, count, self.block);
        tokio::select! {
            entries = read => Ok((entries?, false)),
            Ok(()) = shutdown.changed() => {
                debug!(stream = %self.stream, group = %self.group, "Shutdown while waiting for events");
                Ok((Vec::new(), false))
            }
        }
    }

    async fn acknowledge(&self, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let acked = self.store.ack(&self.stream, &self.group, ids).await?;
        metrics::record_ack(&self.group, acked as usize);
        Ok(())
    }

    /// Handle one batch of up to `batch_size` events.
    ///
    /// Returns `Ok(false)` when no events arrived before the block time
    /// elapsed or `shutdown` was signalled.
    pub async fn consume(
        &self,
        mut shutdown: watch::Receiver<bool>,
        batch_size: usize,
        handler: &dyn EventHandler,
    ) -> Result<bool, BrokerError> {
        if *shutdown.borrow() {
            return Ok(false);
        }
        self.ensure_group().await?;
        let (entries, from_pending) = self.read(&mut shutdown, batch_size.max(1)).await?;
        if entries.is_empty() {
            return Ok(false);
        }

        let mut events = Vec::with_capacity(entries.len());
        let mut poisoned = Vec::new();
        for entry in entries {
            let id = entry.id.clone();
            match Event::from_entry(&self.stream, entry) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(stream = %self.stream, group = %self.group, id = %id, error = %e, "Dropping undecodable event");
                    poisoned.push(id);
                }
            }
        }
        self.acknowledge(&poisoned).await?;
        debug!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.name,
            count = events.len(),
            redelivered = from_pending,
            "Handling event batch"
        );

        let full_batch = events.len() + poisoned.len() >= batch_size;
        let outcome = AssertUnwindSafe(handler.handle(&events)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                let ids: Vec<String> = events.iter().map(|e| e.id().to_string()).collect();
                self.acknowledge(&ids).await?;
                if !(from_pending && full_batch) {
                    self.store
                        .delete_consumer(&self.stream, &self.group, &self.name)
                        .await?;
                }
                Ok(true)
            }
            Ok(Err(e)) => {
                let ids: Vec<String> = events.iter().filter(|e| e.is_acked()).map(|e| e.id().to_string()).collect();
                self.acknowledge(&ids).await?;
                metrics::record_handler_failure(&self.group, false);
                warn!(group = %self.group, acked = ids.len(), error = %e, "Event handler failed");
                Err(BrokerError::Handler(e))
            }
            Err(panic) => {
                let ids: Vec<String> = events.iter().filter(|e| e.is_acked()).map(|e| e.id().to_string()).collect();
                self.acknowledge(&ids).await?;
                metrics::record_handler_failure(&self.group, true);
                let message = panic_message(panic.as_ref());
                error!(group = %self.group, acked = ids.len(), panic = %message, "Event handler panicked");
                Err(BrokerError::HandlerPanicked(message))
            }
        }
    }
}
