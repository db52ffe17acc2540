// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{RemoteCache, StorageError};

/// Process-local stand-in for the remote cache.
pub struct InMemoryCache {
    data: DashMap<String, (String, Option<Instant>)>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current key count (expired keys included until read)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let expired = match self.data.get(key) {
            None => return Ok(None),
            Some(entry) => match entry.value() {
                (_, Some(deadline)) if *deadline <= Instant::now() => true,
                (value, _) => return Ok(Some(value.clone())),
            },
        };
        if expired {
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.data.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.data.remove(key);
        }
        Ok(())
    }
}
