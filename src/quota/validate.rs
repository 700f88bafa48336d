use std::sync::Arc;

use tracing::{error, warn};

use crate::cache::TokenCache;
use crate::errors::QuotaError;
use crate::models::token::{Token, TokenStatus};
use crate::store::QuotaStore;

/// Resolves a presented key to a usable token.
///
/// Expiry and exhaustion are only discovered here, on read; the matching
/// status is then persisted best-effort so later lookups fail fast.
#[derive(Clone)]
pub struct TokenValidator {
    store: Arc<dyn QuotaStore>,
    cache: TokenCache,
    cache_ttl_secs: u64,
}

impl TokenValidator {
    pub fn new(store: Arc<dyn QuotaStore>, cache: TokenCache, cache_ttl_secs: u64) -> Self {
        Self {
            store,
            cache,
            cache_ttl_secs,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn validate_key(&self, key: &str) -> Result<Token, QuotaError> {
        self.validate_key_at(key, chrono::Utc::now().timestamp()).await
    }

    /// Same as [`validate_key`](Self::validate_key) with an explicit clock.
    pub async fn validate_key_at(&self, key: &str, now: i64) -> Result<Token, QuotaError> {
        if key.is_empty() {
            return Err(QuotaError::MissingKey);
        }

        let token = self.lookup(key).await?.ok_or(QuotaError::NotFound)?;

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => return Err(QuotaError::Disabled),
            TokenStatus::Expired => return Err(QuotaError::Expired),
            TokenStatus::Exhausted => return Err(QuotaError::Exhausted),
        }

        if token.is_expired_at(now) {
            self.transition(&token, TokenStatus::Expired).await;
            return Err(QuotaError::Expired);
        }

        if !token.unlimited_quota && token.remaining_quota <= 0 {
            self.transition(&token, TokenStatus::Exhausted).await;
            return Err(QuotaError::Exhausted);
        }

        let store = self.store.clone();
        let token_id = token.id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_accessed(token_id, now).await {
                warn!(token_id, error = %e, "failed to update token access time");
            }
        });

        Ok(token)
    }

    async fn lookup(&self, key: &str) -> anyhow::Result<Option<Token>> {
        let cache_key = TokenCache::key_for(key);
        if let Some(token) = self.cache.get::<Token>(&cache_key).await {
            return Ok(Some(token));
        }
        let token = self.store.get_token_by_key(key).await?;
        if let Some(ref t) = token {
            if let Err(e) = self.cache.set(&cache_key, t, self.cache_ttl_secs).await {
                warn!(token_id = t.id, error = %e, "failed to cache token");
            }
        }
        Ok(token)
    }

    /// Best-effort: a failed status write is logged and not retried.
    async fn transition(&self, token: &Token, status: TokenStatus) {
        if let Err(e) = self.store.set_status(token.id, status).await {
            error!(token_id = token.id, ?status, error = %e, "failed to update token status");
        }
        self.cache.invalidate(&TokenCache::key_for(&token.key)).await;
    }
}
