use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Two-tier lookup cache: in-memory DashMap (tier 1) optionally backed by
/// Redis (tier 2). The store stays the source of truth; callers fall back
/// to it on a miss.
///
/// Local entries honour their TTL lazily on read; `evict_expired()` sweeps
/// the rest. Redis errors degrade to a miss and are never surfaced.
#[derive(Clone)]
pub struct TokenCache {
    local: Arc<DashMap<String, CacheEntry>>,
    redis: Option<ConnectionManager>,
}

impl TokenCache {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            redis,
        }
    }

    /// Local tier only.
    pub fn local_only() -> Self {
        Self::new(None)
    }

    pub fn key_for(token_key: &str) -> String {
        format!("token:key:{}", token_key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory (with TTL check)
        if let Some(entry) = self.local.get(key) {
            if Instant::now() < entry.expires_at {
                return serde_json::from_str(&entry.value).ok();
            }
            // expired — drop the ref before removing
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis
        let mut conn = self.redis.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(v)) => {
                // Re-use the Redis TTL for the local entry.
                let ttl_secs: i64 = conn.ttl(key).await.unwrap_or(60);
                let ttl = Duration::from_secs(if ttl_secs > 0 { ttl_secs as u64 } else { 60 });
                self.local.insert(
                    key.to_string(),
                    CacheEntry {
                        value: v.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                serde_json::from_str(&v).ok()
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "redis cache read failed");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(
            key.to_string(),
            CacheEntry {
                value: json.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );

        if let Some(mut conn) = self.redis.clone() {
            if let Err(e) = conn.set_ex::<_, _, ()>(key, json, ttl_secs).await {
                tracing::warn!(key, error = %e, "redis cache write failed");
            }
        }
        Ok(())
    }

    /// Drop a key from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.local.remove(key);
        if let Some(mut conn) = self.redis.clone() {
            if let Err(e) = conn.del::<_, ()>(key).await {
                tracing::warn!(key, error = %e, "redis cache invalidation failed");
            }
        }
    }

    /// Remove all locally-expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.local.len())
    }

    /// Current number of entries in the local tier.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_roundtrip() {
        let cache = TokenCache::local_only();
        cache.set("k", &42i64, 60).await.unwrap();
        assert_eq!(cache.get::<i64>("k").await, Some(42));
        cache.invalidate("k").await;
        assert_eq!(cache.get::<i64>("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses_and_swept() {
        let cache = TokenCache::local_only();
        cache.set("a", &1i64, 0).await.unwrap();
        cache.set("b", &2i64, 60).await.unwrap();
        assert_eq!(cache.get::<i64>("a").await, None);
        cache.set("c", &3i64, 0).await.unwrap();
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.local_len(), 1);
    }

    async fn redis_cache() -> TokenCache {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        TokenCache::new(Some(conn))
    }

    #[tokio::test]
    #[ignore = "requires Redis at REDIS_URL"]
    async fn test_redis_tier_is_shared_between_instances() {
        let writer = redis_cache().await;
        let reader = redis_cache().await;
        let key = format!("token:key:shared-{}", uuid::Uuid::new_v4());

        writer.set(&key, &77i64, 30).await.unwrap();
        assert_eq!(reader.local_len(), 0);
        assert_eq!(reader.get::<i64>(&key).await, Some(77));
        // the hit was copied into the reader's local tier
        assert_eq!(reader.local_len(), 1);

        writer.invalidate(&key).await;
        assert_eq!(redis_cache().await.get::<i64>(&key).await, None);
    }
}
