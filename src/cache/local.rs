//! Bounded in-process cache pools.
//!
//! Each pool is an LRU guarded by one mutex. Individual operations are
//! atomic; sequences of operations are not, so [`LocalCache::get_set`]
//! computes its value outside the lock and the last writer wins.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::metrics;

#[derive(Debug, Clone)]
struct Slot {
    value: JsonValue,
    expires: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

pub struct LocalCache {
    code: String,
    limit: usize,
    entries: Mutex<LruCache<String, Slot>>,
}

impl LocalCache {
    /// A pool holding at most `limit` keys (at least one).
    #[must_use]
    pub fn new(code: &str, limit: usize) -> Self {
        let capacity = NonZeroUsize::new(limit.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            code: code.to_string(),
            limit,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let found = entries
            .get(key)
            .map(|slot| slot.is_live(now).then(|| slot.value.clone()));
        let hit = match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        metrics::record_local_cache_lookup(&self.code, hit.is_some());
        hit
    }

    pub fn set(&self, key: &str, value: JsonValue) {
        self.put(key, value, None);
    }

    pub fn set_with_ttl(&self, key: &str, value: JsonValue, ttl: Duration) {
        self.put(key, value, Some(Instant::now() + ttl));
    }

    fn put(&self, key: &str, value: JsonValue, expires: Option<Instant>) {
        self.entries.lock().put(key.to_string(), Slot { value, expires });
    }

    /// Cached value for `key`, computing and storing it on a miss.
    /// A zero `ttl` keeps the value until it is evicted or removed.
    pub fn get_set<F>(&self, key: &str, ttl: Duration, provider: F) -> JsonValue
    where
        F: FnOnce() -> JsonValue,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = provider();
        if ttl.is_zero() {
            self.set(key, value.clone());
        } else {
            self.set_with_ttl(key, value.clone(), ttl);
        }
        value
    }

    /// Values in key order, `None` for misses.
    pub fn mget(&self, keys: &[&str]) -> Vec<Option<JsonValue>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    pub fn mset(&self, pairs: Vec<(String, JsonValue)>) {
        let mut entries = self.entries.lock();
        for (key, value) in pairs {
            entries.put(key, Slot { value, expires: None });
        }
    }

    pub fn remove(&self, keys: &[&str]) {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.pop(*key);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("code", &self.code)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set_computes_once() {
        let cache = LocalCache::new("default", 100);
        let first = cache.get_set("k", Duration::from_secs(10), || json!("hello"));
        let second = cache.get_set("k", Duration::from_secs(10), || json!("hello2"));
        assert_eq!(first, json!("hello"));
        assert_eq!(second, json!("hello"));

        cache.remove(&["k"]);
        let third = cache.get_set("k", Duration::from_secs(10), || json!("hello3"));
        assert_eq!(third, json!("hello3"));
    }

    #[test]
    fn test_mget_mset_and_remove() {
        let cache = LocalCache::new("default", 100);
        assert_eq!(cache.mget(&["a", "b", "c"]), vec![None, None, None]);
        cache.mset(vec![("a".into(), json!("a")), ("c".into(), json!("c"))]);
        assert_eq!(cache.mget(&["a", "b", "c"]), vec![Some(json!("a")), None, Some(json!("c"))]);
        cache.remove(&["a"]);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_limit_evicts_least_recent() {
        let cache = LocalCache::new("small", 2);
        cache.set("a", json!(1));
        cache.set("b", json!(2));
        assert!(cache.get("a").is_some());
        cache.set("c", json!(3));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.limit(), 2);
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = LocalCache::new("default", 10);
        cache.set_with_ttl("k", json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
