// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush execution.
//!
//! A [`Flusher`] borrows the entities it tracks for one flush cycle. In
//! immediate mode their records are executed per relational pool, one
//! transaction per pool in first-use order, aborting at the first failing
//! statement. Caches of every committed record are invalidated afterwards.
//! In lazy mode the records are published to the lazy-flush stream instead
//! and replayed later by the lazy-flush consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::diff::{build_flush, EntitySqlFlush, FlushAction};
use super::sql::plan_statements;
use super::FlushError;
use crate::cache::Invalidation;
use crate::engine::Engine;
use crate::entity::Entity;
use crate::metrics::{self, FlushTimer};
use crate::registry::{SchemaRef, LAZY_FLUSH_STREAM};
use crate::storage::SqlStatement;

/// Process-wide identity source for `uuid` entities, seeded from the clock
/// so restarts keep counting upwards.
pub fn next_uuid() -> u64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            AtomicU64::new(secs << 28)
        })
        .fetch_add(1, Ordering::Relaxed)
        + 1
}

pub struct Flusher<'a> {
    engine: Engine,
    tracked: Vec<&'a mut Entity>,
}

impl<'a> Flusher<'a> {
    pub(crate) fn new(engine: Engine) -> Self {
        Self {
            engine,
            tracked: Vec::new(),
        }
    }

    pub fn track(&mut self, entity: &'a mut Entity) -> &mut Self {
        self.tracked.push(entity);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }

    fn prepare(&mut self, lazy: bool) -> Result<Vec<(usize, SchemaRef, EntitySqlFlush)>, FlushError> {
        let mut records = Vec::new();
        for (index, entity) in self.tracked.iter_mut().enumerate() {
            let schema = entity.schema().clone();
            if schema.has_uuid() && entity.is_new() && entity.id() == 0 {
                entity.set_id(next_uuid());
            }
            let Some(record) = build_flush(entity)? else {
                continue;
            };
            if lazy && record.action == FlushAction::Insert && record.id == 0 {
                return Err(FlushError::LazyInsertWithoutId {
                    entity: schema.entity_name().to_string(),
                });
            }
            records.push((index, schema, record));
        }
        Ok(records)
    }

    fn commit(&mut self, committed: Vec<(usize, SchemaRef, EntitySqlFlush)>) {
        for (index, schema, record) in committed {
            let entity = &mut self.tracked[index];
            match record.action {
                FlushAction::Delete => entity.commit(record.id, None),
                FlushAction::Insert | FlushAction::Update => {
                    entity.commit(record.id, Some(record.row_after(&schema)));
                }
            }
        }
        self.tracked.clear();
    }

    /// Execute every tracked change against the relational store.
    pub async fn flush(&mut self) -> Result<(), FlushError> {
        let prepared = self.prepare(false)?;
        if prepared.is_empty() {
            self.tracked.clear();
            return Ok(());
        }
        let records: Vec<(SchemaRef, EntitySqlFlush)> = prepared
            .iter()
            .map(|(_, schema, record)| (schema.clone(), record.clone()))
            .collect();
        let executed = self.engine.execute_flushes(records).await?;
        let committed = prepared
            .into_iter()
            .zip(executed)
            .map(|((index, schema, _), record)| (index, schema, record))
            .collect();
        self.commit(committed);
        Ok(())
    }

    /// Queue every tracked change on the lazy-flush stream.
    pub async fn flush_lazy(&mut self) -> Result<(), FlushError> {
        let prepared = self.prepare(true)?;
        if prepared.is_empty() {
            self.tracked.clear();
            return Ok(());
        }
        let payload: Vec<&EntitySqlFlush> = prepared.iter().map(|(_, _, record)| record).collect();
        let id = self
            .engine
            .event_broker()
            .publish(LAZY_FLUSH_STREAM, &payload)
            .await?;
        for (_, schema, record) in &prepared {
            metrics::record_flush(schema.entity_name(), record.action.as_str(), true);
        }
        debug!(event = %id, records = prepared.len(), "Queued lazy flush");
        self.commit(prepared);
        Ok(())
    }
}

impl Engine {
    /// Execute records in order, one transaction per relational pool, and
    /// invalidate caches of everything that committed. Returns the records
    /// with generated identities filled in.
    pub(crate) async fn execute_flushes(
        &self,
        mut records: Vec<(SchemaRef, EntitySqlFlush)>,
    ) -> Result<Vec<EntitySqlFlush>, FlushError> {
        let mut pools: Vec<String> = Vec::new();
        for (schema, _) in &records {
            if !pools.iter().any(|p| p == schema.mysql_pool()) {
                pools.push(schema.mysql_pool().to_string());
            }
        }

        let mut invalidation = Invalidation::default();
        let mut failure = None;
        for pool in pools {
            let Some(store) = self.relational(&pool) else {
                failure = Some(FlushError::MissingPool(pool));
                break;
            };
            let indices: Vec<usize> = (0..records.len())
                .filter(|i| records[*i].0.mysql_pool() == pool)
                .collect();
            let plans = {
                let members: Vec<_> = indices
                    .iter()
                    .map(|i| (records[*i].0.as_ref(), &records[*i].1))
                    .collect();
                plan_statements(&members)
            };
            let statements: Vec<SqlStatement> = plans.iter().map(|p| p.statement.clone()).collect();

            let outcome = {
                let _timer = FlushTimer::new(&pool);
                store.execute(&statements).await
            };
            let results = match outcome {
                Ok(results) => results,
                Err(source) => {
                    metrics::record_flush_error(&pool);
                    warn!(pool = %pool, statements = statements.len(), error = %source, "Flush rejected");
                    failure = Some(FlushError::Storage { pool, source });
                    break;
                }
            };

            for (plan, result) in plans.iter().zip(results) {
                if let [single] = plan.records[..] {
                    let record = &mut records[indices[single]].1;
                    if record.action == FlushAction::Insert && record.id == 0 {
                        match result.last_insert_id {
                            Some(id) => record.id = id,
                            None => warn!(pool = %pool, entity = %record.entity, "Insert returned no identity"),
                        }
                    }
                }
            }
            for index in &indices {
                let (schema, record) = &records[*index];
                invalidation.collect(schema, record);
                metrics::record_flush(&record.entity, record.action.as_str(), false);
            }
            debug!(pool = %pool, records = indices.len(), statements = statements.len(), "Flush committed");
        }

        if !invalidation.is_empty() {
            // Failures are logged and counted by the coordinator.
            let _ = self.cache().invalidate(&invalidation).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(records.into_iter().map(|(_, record)| record).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_is_monotonic() {
        let a = next_uuid();
        let b = next_uuid();
        assert!(b > a);
        assert!(a > 1 << 28);
    }
}
