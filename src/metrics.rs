// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the entity sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `entity_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `entity`: registered entity name
//! - `action`: insert, update, delete
//! - `pool`: relational or cache pool code
//! - `stream` / `group`: broker stream and consumer group

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one flushed row
pub fn record_flush(entity: &str, action: &str, lazy: bool) {
    counter!(
        "entity_sync_flushes_total",
        "entity" => entity.to_string(),
        "action" => action.to_string(),
        "mode" => if lazy { "lazy" } else { "immediate" }
    )
    .increment(1);
}

/// Record a failed immediate flush
pub fn record_flush_error(pool: &str) {
    counter!(
        "entity_sync_flush_errors_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}

/// Record statement execution latency per relational pool
pub fn record_flush_latency(pool: &str, duration: Duration) {
    histogram!(
        "entity_sync_flush_seconds",
        "pool" => pool.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record local cache lookups
pub fn record_local_cache_lookup(pool: &str, hit: bool) {
    counter!(
        "entity_sync_local_cache_lookups_total",
        "pool" => pool.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record remote cache lookups
pub fn record_remote_cache_lookup(pool: &str, hit: bool) {
    counter!(
        "entity_sync_remote_cache_lookups_total",
        "pool" => pool.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record invalidated cache keys
pub fn record_invalidations(tier: &str, count: usize) {
    counter!(
        "entity_sync_cache_invalidations_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Record a best-effort remote cache failure
pub fn record_cache_error(pool: &str, operation: &str) {
    counter!(
        "entity_sync_cache_errors_total",
        "pool" => pool.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record published events
pub fn record_publish(stream: &str, count: usize) {
    counter!(
        "entity_sync_events_published_total",
        "stream" => stream.to_string()
    )
    .increment(count as u64);
}

/// Record acknowledged events
pub fn record_ack(group: &str, count: usize) {
    counter!(
        "entity_sync_events_acked_total",
        "group" => group.to_string()
    )
    .increment(count as u64);
}

/// Record a consume batch that failed in its handler
pub fn record_handler_failure(group: &str, panicked: bool) {
    counter!(
        "entity_sync_handler_failures_total",
        "group" => group.to_string(),
        "kind" => if panicked { "panic" } else { "error" }
    )
    .increment(1);
}

/// Set the pending entry count last observed for a group
pub fn set_pending(group: &str, pending: u64) {
    gauge!(
        "entity_sync_group_pending",
        "group" => group.to_string()
    )
    .set(pending as f64);
}

/// Record a lazy flush batch falling back to per-event replay
pub fn record_isolated_replay() {
    counter!("entity_sync_lazy_isolated_replays_total").increment(1);
}

/// Record the outcome of the resolver chain for one record
pub fn record_resolver_outcome(resolved: bool) {
    counter!(
        "entity_sync_lazy_resolver_outcomes_total",
        "outcome" => if resolved { "resolved" } else { "unresolved" }
    )
    .increment(1);
}

/// A timing guard that records flush latency on drop
pub struct FlushTimer {
    pool: String,
    start: Instant,
}

impl FlushTimer {
    /// Start a new latency timer
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        record_flush_latency(&self.pool, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests verify the API compiles and doesn't panic.
    // No recorder is installed, so every call is a no-op.

    #[test]
    fn test_flush_metrics() {
        record_flush("User", "insert", false);
        record_flush("User", "update", true);
        record_flush_error("default");
        record_flush_latency("default", Duration::from_millis(3));
    }

    #[test]
    fn test_cache_metrics() {
        record_local_cache_lookup("default", true);
        record_remote_cache_lookup("default", false);
        record_invalidations("local", 3);
        record_cache_error("default", "del");
    }

    #[test]
    fn test_broker_metrics() {
        record_publish("events", 10);
        record_ack("workers", 10);
        record_handler_failure("workers", true);
        set_pending("workers", 0);
        record_isolated_replay();
        record_resolver_outcome(false);
    }

    #[test]
    fn test_flush_timer() {
        {
            let _timer = FlushTimer::new("default");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
