//! In-process quota store.
//!
//! Backs tests and embedded deployments. Every operation runs under a single
//! lock, so each call is atomic with respect to every other call. Failures can
//! be injected per token or store-wide to exercise the retry paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::QuotaStore;
use crate::models::account::AccountQuota;
use crate::models::delta::{QuotaDelta, QuotaTarget};
use crate::models::token::{Token, TokenStatus};

#[derive(Default)]
struct State {
    tokens: HashMap<i64, Token>,
    accounts: HashMap<i64, AccountQuota>,
    failing_tokens: HashSet<i64>,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_token(&self, token: Token) {
        self.state.lock().await.tokens.insert(token.id, token);
    }

    pub async fn insert_account(&self, account: AccountQuota) {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.account_id, account);
    }

    pub async fn token(&self, id: i64) -> Option<Token> {
        self.state.lock().await.tokens.get(&id).cloned()
    }

    pub async fn account(&self, id: i64) -> Option<AccountQuota> {
        self.state.lock().await.accounts.get(&id).copied()
    }

    /// Make every relative update touching this token fail until healed.
    pub async fn fail_token(&self, token_id: i64) {
        self.state.lock().await.failing_tokens.insert(token_id);
    }

    pub async fn heal_token(&self, token_id: i64) {
        self.state.lock().await.failing_tokens.remove(&token_id);
    }

    /// Simulate a full outage: every call fails.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Number of successful counter writes (one per relative update).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl State {
    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable {
            anyhow::bail!("store unavailable");
        }
        Ok(())
    }

    fn check_update(&self, target: QuotaTarget, delta: QuotaDelta) -> anyhow::Result<()> {
        self.check_available()?;
        let counters = match target {
            QuotaTarget::Token(id) => {
                if self.failing_tokens.contains(&id) {
                    anyhow::bail!("injected failure for token {}", id);
                }
                self.tokens.get(&id).map(|t| (t.remaining_quota, t.used_quota))
            }
            QuotaTarget::Account(id) => self.accounts.get(&id).map(|a| (a.remaining, a.used)),
        };
        if let Some((remaining, used)) = counters {
            if remaining.checked_add(delta.remaining).is_none() || used.checked_add(delta.used).is_none() {
                anyhow::bail!("quota counter out of range for {:?}", target);
            }
        }
        Ok(())
    }

    fn apply(&mut self, target: QuotaTarget, delta: QuotaDelta) -> bool {
        match target {
            QuotaTarget::Token(id) => match self.tokens.get_mut(&id) {
                Some(t) => {
                    t.remaining_quota += delta.remaining;
                    t.used_quota += delta.used;
                    true
                }
                None => false,
            },
            QuotaTarget::Account(id) => match self.accounts.get_mut(&id) {
                Some(a) => {
                    a.remaining += delta.remaining;
                    a.used += delta.used;
                    true
                }
                None => false,
            },
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_token(&self, id: i64) -> anyhow::Result<Option<Token>> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.tokens.get(&id).cloned())
    }

    async fn get_token_by_key(&self, key: &str) -> anyhow::Result<Option<Token>> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.tokens.values().find(|t| t.key == key).cloned())
    }

    async fn get_account_quota(&self, account_id: i64) -> anyhow::Result<Option<AccountQuota>> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.accounts.get(&account_id).copied())
    }

    async fn apply_relative_update(
        &self,
        target: QuotaTarget,
        delta: QuotaDelta,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.check_update(target, delta)?;
        if state.apply(target, delta) {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(?target, "relative update matched no row");
        }
        Ok(())
    }

    async fn apply_relative_updates(
        &self,
        updates: &[(QuotaTarget, QuotaDelta)],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        // validate everything first so a failure leaves nothing applied
        for (target, delta) in updates {
            state.check_update(*target, *delta)?;
        }
        for (target, delta) in updates {
            if state.apply(*target, *delta) {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn set_status(&self, token_id: i64, status: TokenStatus) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if let Some(t) = state.tokens.get_mut(&token_id) {
            t.status = status;
        }
        Ok(())
    }

    async fn touch_accessed(&self, token_id: i64, at: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if let Some(t) = state.tokens.get_mut(&token_id) {
            t.accessed_at = at;
        }
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.state.lock().await.check_available()
    }
}
