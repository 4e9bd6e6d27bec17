//! In-process cache tier backed by moka.
//!
//! Each entry carries its own TTL through a moka `Expiry` policy. Pattern
//! deletes scan the live entries, which is fine at in-process scale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde_json::Value;

use crate::domain::models::KeyPattern;
use crate::domain::ports::{CacheResult, CacheStore};

/// Default maximum number of cached entries.
const DEFAULT_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
struct CachedValue {
    value: Arc<Value>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &CachedValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache tier on moka, honouring a TTL per entry.
pub struct MokaCacheStore {
    entries: Cache<String, CachedValue>,
}

impl Default for MokaCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

impl MokaCacheStore {
    /// Cache holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { entries }
    }

    /// Approximate number of live entries after pending maintenance runs.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    /// Whether no live entries remain.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MokaCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        Ok(self.entries.get(key).await.map(|c| Value::clone(&c.value)))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        self.entries
            .insert(key.to_string(), CachedValue { value: Arc::new(value), ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn delete_pattern(&self, pattern: &KeyPattern) -> CacheResult<u64> {
        let matching: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(k, _)| pattern.matches(k))
            .map(|(k, _)| k)
            .collect();

        let mut removed = 0;
        for key in matching {
            if self.entries.remove(key.as_str()).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete_is_idempotent() {
        let cache = MokaCacheStore::default();
        cache.set("user:U1", json!({"n": 1}), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("user:U1").await.unwrap(), Some(json!({"n": 1})));

        assert!(cache.delete("user:U1").await.unwrap());
        assert!(!cache.delete("user:U1").await.unwrap());
        assert!(cache.get("user:U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire_by_their_own_ttl() {
        let cache = MokaCacheStore::default();
        cache.set("short", json!(1), Duration::from_millis(30)).await.unwrap();
        cache.set("long", json!(2), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("short").await.unwrap().is_none());
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pattern_delete_only_hits_matches() {
        let cache = MokaCacheStore::default();
        for k in ["project:P1:agents", "project:P1:sessions", "project:P2:agents", "agent:P1"] {
            cache.set(k, json!(true), Duration::from_secs(60)).await.unwrap();
        }

        let removed = cache.delete_pattern(&KeyPattern::new("project:P1:*")).await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("project:P2:agents").await.unwrap().is_some());
        assert!(cache.get("agent:P1").await.unwrap().is_some());
        assert_eq!(cache.delete_pattern(&KeyPattern::new("project:P1:*")).await.unwrap(), 0);
    }
}
