use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use super::QuotaStore;
use crate::models::account::AccountQuota;
use crate::models::delta::{QuotaDelta, QuotaTarget};
use crate::models::token::{Token, TokenStatus};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

const TOKEN_COLUMNS: &str = "id, account_id, key, name, status, created_at, accessed_at, \
     expires_at, remaining_quota, used_quota, unlimited_quota";

async fn apply_on(
    conn: &mut PgConnection,
    target: QuotaTarget,
    delta: QuotaDelta,
) -> anyhow::Result<u64> {
    let (sql, id) = match target {
        QuotaTarget::Token(id) => (
            "UPDATE tokens SET remaining_quota = remaining_quota + $2, used_quota = used_quota + $3 WHERE id = $1",
            id,
        ),
        QuotaTarget::Account(id) => (
            "UPDATE accounts SET remaining_quota = remaining_quota + $2, used_quota = used_quota + $3 WHERE id = $1",
            id,
        ),
    };
    let result = sqlx::query(sql)
        .bind(id)
        .bind(delta.remaining)
        .bind(delta.used)
        .execute(conn)
        .await
        .with_context(|| format!("relative update on {:?} failed", target))?;
    Ok(result.rows_affected())
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn get_token(&self, id: i64) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM tokens WHERE id = $1",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Token::from))
    }

    async fn get_token_by_key(&self, key: &str) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM tokens WHERE key = $1",
            TOKEN_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Token::from))
    }

    async fn get_account_quota(&self, account_id: i64) -> anyhow::Result<Option<AccountQuota>> {
        let row = sqlx::query_as::<_, AccountQuotaRow>(
            "SELECT id, remaining_quota, used_quota FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AccountQuota {
            account_id: r.id,
            remaining: r.remaining_quota,
            used: r.used_quota,
        }))
    }

    async fn apply_relative_update(
        &self,
        target: QuotaTarget,
        delta: QuotaDelta,
    ) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        let affected = apply_on(&mut conn, target, delta).await?;
        if affected == 0 {
            tracing::warn!(?target, "relative update matched no row");
        }
        Ok(())
    }

    async fn apply_relative_updates(
        &self,
        updates: &[(QuotaTarget, QuotaDelta)],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for (target, delta) in updates {
            let affected = apply_on(&mut tx, *target, *delta).await?;
            if affected == 0 {
                tracing::warn!(target = ?target, "relative update matched no row");
            }
        }
        tx.commit().await.context("failed to commit quota updates")?;
        Ok(())
    }

    async fn set_status(&self, token_id: i64, status: TokenStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE tokens SET status = $2 WHERE id = $1")
            .bind(token_id)
            .bind(status.as_i16())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_accessed(&self, token_id: i64, at: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE tokens SET accessed_at = $2 WHERE id = $1")
            .bind(token_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

// -- Output structs --

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    id: i64,
    account_id: i64,
    key: String,
    name: String,
    status: i16,
    created_at: i64,
    accessed_at: i64,
    expires_at: i64,
    remaining_quota: i64,
    used_quota: i64,
    unlimited_quota: bool,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: row.id,
            account_id: row.account_id,
            key: row.key,
            name: row.name,
            status: TokenStatus::from_i16(row.status),
            created_at: row.created_at,
            accessed_at: row.accessed_at,
            expires_at: row.expires_at,
            remaining_quota: row.remaining_quota,
            used_quota: row.used_quota,
            unlimited_quota: row.unlimited_quota,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountQuotaRow {
    id: i64,
    remaining_quota: i64,
    used_quota: i64,
}
