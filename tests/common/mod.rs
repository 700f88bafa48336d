#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use quota_meter::models::account::AccountQuota;
use quota_meter::models::token::{Token, TokenStatus, NEVER_EXPIRES};
use quota_meter::notification::{QuotaAlert, QuotaNotifier};
use quota_meter::store::memory::MemoryStore;

pub const ACCOUNT_ID: i64 = 1;

pub fn token(id: i64, remaining: i64) -> Token {
    Token {
        id,
        account_id: ACCOUNT_ID,
        key: format!("sk-{:0>45}", id),
        name: format!("token-{}", id),
        status: TokenStatus::Enabled,
        created_at: 0,
        accessed_at: 0,
        expires_at: NEVER_EXPIRES,
        remaining_quota: remaining,
        used_quota: 0,
        unlimited_quota: false,
    }
}

/// A store with one account and the given tokens attached to it.
pub async fn store_with(account_remaining: i64, tokens: Vec<Token>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_account(AccountQuota {
            account_id: ACCOUNT_ID,
            remaining: account_remaining,
            used: 0,
        })
        .await;
    for t in tokens {
        store.insert_token(t).await;
    }
    store
}

/// Notifier that remembers every alert it was handed.
#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<QuotaAlert>>,
}

impl RecordingNotifier {
    pub fn taken(&self) -> Vec<QuotaAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl QuotaNotifier for RecordingNotifier {
    async fn notify(&self, alert: QuotaAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert);
        Ok(())
    }
}
