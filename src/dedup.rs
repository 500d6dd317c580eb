//! LRU+TTL cache of recently processed keys with memoized handler results.

use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::DeduplicatorConfig;

struct Entry {
    value: Value,
    inserted_at: Instant,
}

/// Deduplicates handler invocations by a derived key within a TTL window.
pub struct Deduplicator {
    cache: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    enabled: bool,
}

/// Outcome of a deduplicated lookup.
pub enum Lookup {
    /// First observation of this key; caller should run the handler and
    /// call [`Deduplicator::store`] with the result.
    Miss,
    /// A cached result, not yet expired.
    Hit(Value),
}

impl Deduplicator {
    pub fn new(config: DeduplicatorConfig) -> Self {
        let capacity = std::num::NonZeroUsize::new(config.capacity.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
            enabled: true,
        }
    }

    /// A disabled deduplicator bypasses the cache entirely; the handler
    /// always runs.
    pub fn disabled() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(1).unwrap())),
            ttl: Duration::ZERO,
            enabled: false,
        }
    }

    /// Derives the dedup key: `key_extractor(payload)` if supplied, else
    /// `message_id`, else the SHA-256 hex digest of the raw content.
    pub fn derive_key(
        payload: &Value,
        message_id: Option<&str>,
        raw_content: &[u8],
        key_extractor: Option<&dyn Fn(&Value) -> Option<String>>,
    ) -> String {
        if let Some(extractor) = key_extractor {
            if let Some(key) = extractor(payload) {
                return key;
            }
        }
        if let Some(id) = message_id {
            return id.to_string();
        }
        let digest = Sha256::digest(raw_content);
        format!("{:x}", digest)
    }

    pub async fn lookup(&self, key: &str) -> Lookup {
        if !self.enabled {
            return Lookup::Miss;
        }
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(key) {
            if entry.inserted_at.elapsed() <= self.ttl {
                return Lookup::Hit(entry.value.clone());
            }
            cache.pop(key);
        }
        Lookup::Miss
    }

    pub async fn store(&self, key: String, value: Value) {
        if !self.enabled {
            return;
        }
        let mut cache = self.cache.lock().await;
        cache.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit_within_ttl() {
        let dedup = Deduplicator::new(DeduplicatorConfig {
            capacity: 8,
            ttl: Duration::from_secs(60),
        });
        let key = Deduplicator::derive_key(&serde_json::json!({"a": 1}), Some("m1"), b"{}", None);
        assert!(matches!(dedup.lookup(&key).await, Lookup::Miss));
        dedup.store(key.clone(), serde_json::json!({"sum": 1})).await;
        match dedup.lookup(&key).await {
            Lookup::Hit(v) => assert_eq!(v, serde_json::json!({"sum": 1})),
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let dedup = Deduplicator::new(DeduplicatorConfig {
            capacity: 8,
            ttl: Duration::from_millis(10),
        });
        dedup.store("k".to_string(), serde_json::json!(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(dedup.lookup("k").await, Lookup::Miss));
    }

    #[tokio::test]
    async fn disabled_always_misses() {
        let dedup = Deduplicator::disabled();
        dedup.store("k".to_string(), serde_json::json!(1)).await;
        assert!(matches!(dedup.lookup("k").await, Lookup::Miss));
    }

    #[test]
    fn key_extractor_takes_priority() {
        let extractor: &dyn Fn(&Value) -> Option<String> =
            &|v: &Value| v.get("userId").and_then(|x| x.as_str()).map(String::from);
        let key = Deduplicator::derive_key(
            &serde_json::json!({"userId": "u1"}),
            Some("m1"),
            b"{}",
            Some(extractor),
        );
        assert_eq!(key, "u1");
    }

    #[test]
    fn falls_back_to_content_hash() {
        let key = Deduplicator::derive_key(&serde_json::json!({}), None, b"hello", None);
        assert_eq!(key.len(), 64);
    }
}
