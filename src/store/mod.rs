pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::account::AccountQuota;
use crate::models::delta::{QuotaDelta, QuotaTarget};
use crate::models::token::{Token, TokenStatus};

/// Durable quota store.
/// Implementations: PgStore (Postgres), MemoryStore (in-process).
///
/// Every counter mutation is a relative update applied atomically by the
/// store; callers never read a counter and write it back.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_token(&self, id: i64) -> anyhow::Result<Option<Token>>;

    async fn get_token_by_key(&self, key: &str) -> anyhow::Result<Option<Token>>;

    async fn get_account_quota(&self, account_id: i64) -> anyhow::Result<Option<AccountQuota>>;

    /// Apply `field = field + delta` to one counter pair.
    /// A target row that does not exist is a no-op.
    async fn apply_relative_update(
        &self,
        target: QuotaTarget,
        delta: QuotaDelta,
    ) -> anyhow::Result<()>;

    /// Apply several relative updates all-or-nothing.
    async fn apply_relative_updates(
        &self,
        updates: &[(QuotaTarget, QuotaDelta)],
    ) -> anyhow::Result<()>;

    async fn set_status(&self, token_id: i64, status: TokenStatus) -> anyhow::Result<()>;

    async fn touch_accessed(&self, token_id: i64, at: i64) -> anyhow::Result<()>;

    /// Cheap liveness probe used by `/readyz`.
    async fn ping(&self) -> anyhow::Result<()>;
}
