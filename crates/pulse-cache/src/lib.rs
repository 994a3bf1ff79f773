//! Short-TTL key→JSON cache with two interchangeable backends.
//!
//! The redis backend is preferred when reachable; the bounded in-process
//! map absorbs every miss and transport failure. Per the contract a cache
//! call never raises — a broken backend degrades to the map silently.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Hot stream cache key: `base:{user_id}:{stream_type}:{symbol|"all"}`.
pub fn stream_key(user_id: i64, stream_type: &str, symbol: Option<&str>) -> String {
    format!("base:{user_id}:{stream_type}:{}", symbol.unwrap_or("all"))
}

/// TTL-bounded key→JSON store. Implementations never return errors:
/// `get` misses on any failure, `set` drops the write at worst.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: &Value, ttl_secs: u64);
}

/// Bounded in-process fallback map.
pub struct MemoryCache {
    entries: DashMap<String, (String, i64)>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    fn evict_if_full(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        // Evict the entry closest to expiry.
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().1)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now().timestamp();
        // The read guard must drop before any removal on the same shard.
        let expired = match self.entries.get(key) {
            Some(entry) if entry.value().1 > now => {
                return serde_json::from_str(&entry.value().0).ok();
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: &Value, ttl_secs: u64) {
        self.evict_if_full();
        let expiry = Utc::now().timestamp() + ttl_secs as i64;
        self.entries
            .insert(key.to_string(), (value.to_string(), expiry));
    }
}

/// redis-backed cache. Any transport error is absorbed and logged once
/// per call at debug level; callers see a plain miss.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect eagerly so a bad URL is discovered at startup, not on the
    /// first hot tick. A failure here is not fatal to the daemon — the
    /// caller falls back to memory-only caching.
    pub async fn connect(url: &str) -> Option<Self> {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "invalid redis URL — in-process cache only");
                return None;
            }
        };
        match client.get_connection_manager().await {
            Ok(manager) => {
                info!("redis cache connected");
                Some(Self { manager })
            }
            Err(e) => {
                warn!(error = %e, "redis unreachable — in-process cache only");
                None
            }
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut conn = self.manager.clone();
        let raw: redis::RedisResult<Option<String>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await;
        match raw {
            Ok(Some(s)) => serde_json::from_str(&s).ok(),
            Ok(None) => None,
            Err(e) => {
                debug!(key, error = %e, "redis GET failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl_secs: u64) {
        let mut conn = self.manager.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value.to_string())
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            debug!(key, error = %e, "redis SET failed");
        }
    }
}

/// Network cache first, in-process map always. Writes mirror into the map
/// so a later redis outage still serves fresh-enough values.
pub struct TieredCache {
    redis: Option<RedisCache>,
    memory: MemoryCache,
}

impl TieredCache {
    pub fn new(redis: Option<RedisCache>) -> Self {
        Self {
            redis,
            memory: MemoryCache::default(),
        }
    }
}

#[async_trait]
impl Cache for TieredCache {
    async fn get(&self, key: &str) -> Option<Value> {
        if let Some(redis) = &self.redis {
            if let Some(hit) = redis.get(key).await {
                return Some(hit);
            }
        }
        self.memory.get(key).await
    }

    async fn set(&self, key: &str, value: &Value, ttl_secs: u64) {
        if let Some(redis) = &self.redis {
            redis.set(key, value, ttl_secs).await;
        }
        self.memory.set(key, value, ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_key_format() {
        assert_eq!(stream_key(7, "price", Some("BTC")), "base:7:price:BTC");
        assert_eq!(stream_key(7, "news", None), "base:7:news:all");
    }

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = MemoryCache::default();
        cache.set("k", &json!({"last": 1.0}), 60).await;
        assert_eq!(cache.get("k").await.unwrap()["last"], 1.0);
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_expires() {
        let cache = MemoryCache::default();
        cache.set("k", &json!(1), 0).await;
        // ttl 0 means the entry is already at its expiry instant
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_bounded() {
        let cache = MemoryCache::new(2);
        cache.set("a", &json!(1), 10).await;
        cache.set("b", &json!(2), 20).await;
        cache.set("c", &json!(3), 30).await;
        // "a" had the earliest expiry and was evicted to make room.
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn tiered_without_redis_uses_memory() {
        let cache = TieredCache::new(None);
        cache.set("k", &json!({"v": true}), 60).await;
        assert_eq!(cache.get("k").await.unwrap()["v"], true);
    }
}
