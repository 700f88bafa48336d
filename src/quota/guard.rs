//! Pre-flight debit and post-flight reconciliation for one unit of work.
//!
//! Admission happens before the work runs, with an estimated cost debited
//! optimistically from both the token and its account. Once the real cost is
//! known the caller posts the signed difference, which is debited or credited
//! back. Both steps go to the store as one all-or-nothing batch of relative
//! updates, so a store failure never leaves a partial debit behind.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::QuotaError;
use crate::metrics::metrics;
use crate::models::delta::{QuotaDelta, QuotaTarget};
use crate::notification::{QuotaAlert, QuotaNotifier};
use crate::store::QuotaStore;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Account remaining quota below which a low-balance alert fires.
    pub remind_threshold: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            remind_threshold: 1000,
        }
    }
}

#[derive(Clone)]
pub struct ConsumptionGuard {
    store: Arc<dyn QuotaStore>,
    notifier: Arc<dyn QuotaNotifier>,
    config: GuardConfig,
}

impl ConsumptionGuard {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        notifier: Arc<dyn QuotaNotifier>,
        config: GuardConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Admit a unit of work by debiting `estimated_cost` from the token
    /// (unless unlimited) and from the owning account.
    #[tracing::instrument(skip(self))]
    pub async fn pre_consume(&self, token_id: i64, estimated_cost: i64) -> Result<(), QuotaError> {
        let result = self.try_pre_consume(token_id, estimated_cost).await;
        record_outcome("pre", &result);
        result
    }

    async fn try_pre_consume(&self, token_id: i64, cost: i64) -> Result<(), QuotaError> {
        if cost < 0 {
            return Err(QuotaError::InvalidAmount(cost));
        }

        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or(QuotaError::NotFound)?;
        if !token.covers(cost) {
            return Err(QuotaError::InsufficientTokenQuota);
        }

        let account = self
            .store
            .get_account_quota(token.account_id)
            .await?
            .ok_or(QuotaError::AccountNotFound)?;
        if account.remaining < cost {
            return Err(QuotaError::InsufficientAccountQuota);
        }

        if cost == 0 {
            return Ok(());
        }

        let mut updates = Vec::with_capacity(2);
        if !token.unlimited_quota {
            updates.push((QuotaTarget::Token(token_id), QuotaDelta::debit(cost)));
        }
        updates.push((QuotaTarget::Account(token.account_id), QuotaDelta::debit(cost)));
        self.store.apply_relative_updates(&updates).await?;

        debug!(token_id, account_id = token.account_id, cost, "pre-consumed quota");

        if let Some(alert) = QuotaAlert::for_debit(
            token.account_id,
            account.remaining,
            cost,
            self.config.remind_threshold,
        ) {
            self.spawn_alert(alert);
        }
        Ok(())
    }

    /// Apply the signed difference between actual and pre-debited cost.
    ///
    /// Positive `adjustment` debits the remainder, negative credits it back,
    /// zero is a no-op. The account is adjusted first, then the token.
    #[tracing::instrument(skip(self))]
    pub async fn post_consume(&self, token_id: i64, adjustment: i64) -> Result<(), QuotaError> {
        let result = self.try_post_consume(token_id, adjustment).await;
        record_outcome("post", &result);
        result
    }

    async fn try_post_consume(&self, token_id: i64, adjustment: i64) -> Result<(), QuotaError> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or(QuotaError::NotFound)?;

        if adjustment == 0 {
            return Ok(());
        }

        let delta =
            QuotaDelta::for_usage(adjustment).ok_or(QuotaError::InvalidAmount(adjustment))?;
        let mut updates = Vec::with_capacity(2);
        updates.push((QuotaTarget::Account(token.account_id), delta));
        if !token.unlimited_quota {
            updates.push((QuotaTarget::Token(token_id), delta));
        }
        self.store.apply_relative_updates(&updates).await?;

        debug!(token_id, account_id = token.account_id, adjustment, "post-consumed quota");
        Ok(())
    }

    /// Post-consume from the two absolute amounts instead of their difference.
    pub async fn reconcile(
        &self,
        token_id: i64,
        pre_consumed: i64,
        actual_cost: i64,
    ) -> Result<(), QuotaError> {
        if pre_consumed < 0 {
            return Err(QuotaError::InvalidAmount(pre_consumed));
        }
        if actual_cost < 0 {
            return Err(QuotaError::InvalidAmount(actual_cost));
        }
        self.post_consume(token_id, actual_cost - pre_consumed).await
    }

    fn spawn_alert(&self, alert: QuotaAlert) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let account_id = alert.account_id;
            if let Err(e) = notifier.notify(alert).await {
                warn!(account_id, error = %e, "failed to deliver quota alert");
            }
        });
    }
}

fn record_outcome(op: &str, result: &Result<(), QuotaError>) {
    let outcome = match result {
        Ok(()) => "ok",
        Err(e) => e.code(),
    };
    metrics().consume_total.with_label_values(&[op, outcome]).inc();
}
