//! Background job: evict expired entries from the local token cache tier.

use std::time::Duration;
use tokio::time;

use crate::cache::TokenCache;

/// Spawn the sweep task. Call this once at startup.
pub fn spawn(cache: TokenCache) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = cache.local_len(), "token cache sweep");
            }
        }
    });
}
