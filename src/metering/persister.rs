use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use crate::models::delta::{PendingDelta, QuotaDelta, QuotaTarget};
use crate::store::QuotaStore;

/// Applies drained deltas to the store with bounded fan-out.
///
/// Entries are written in groups of `batch_size`, one task per entry, and a
/// group must finish before the next one starts. Failures are reported on a
/// channel drained by a dedicated collector task, so a failing writer never
/// waits on the caller.
#[derive(Clone)]
pub struct BatchPersister {
    store: Arc<dyn QuotaStore>,
    batch_size: usize,
}

impl BatchPersister {
    pub fn new(store: Arc<dyn QuotaStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Persist every entry and return the ones that failed.
    pub async fn persist(&self, entries: Vec<PendingDelta>) -> Vec<PendingDelta> {
        if entries.is_empty() {
            return Vec::new();
        }

        let (fail_tx, mut fail_rx) = mpsc::channel::<PendingDelta>(self.batch_size);
        let collector = tokio::spawn(async move {
            let mut failed = Vec::new();
            while let Some(entry) = fail_rx.recv().await {
                failed.push(entry);
            }
            failed
        });

        for group in entries.chunks(self.batch_size) {
            let tasks: Vec<_> = group
                .iter()
                .map(|&entry| {
                    let store = self.store.clone();
                    let fail_tx = fail_tx.clone();
                    let handle = tokio::spawn(async move {
                        let target = QuotaTarget::Token(entry.token_id);
                        // i64::MIN has no credit form; requeued through the
                        // aggregator it comes back split in two
                        let Some(delta) = QuotaDelta::for_usage(entry.delta) else {
                            error!(token_id = entry.token_id, delta = entry.delta, "usage delta out of range");
                            let _ = fail_tx.send(entry).await;
                            return;
                        };
                        if let Err(e) = store.apply_relative_update(target, delta).await {
                            error!(
                                token_id = entry.token_id,
                                delta = entry.delta,
                                error = %e,
                                "failed to persist token usage"
                            );
                            let _ = fail_tx.send(entry).await;
                        }
                    });
                    (entry, handle)
                })
                .collect();

            for (entry, handle) in tasks {
                if let Err(e) = handle.await {
                    error!(token_id = entry.token_id, error = %e, "token usage persist task aborted");
                    let _ = fail_tx.send(entry).await;
                }
            }
        }
        drop(fail_tx);

        let failed = match collector.await {
            Ok(failed) => failed,
            Err(e) => {
                error!(error = %e, "usage failure collector aborted");
                Vec::new()
            }
        };
        if !failed.is_empty() {
            error!(failed = failed.len(), total = entries.len(), "batch token usage persist failed");
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::token::{Token, TokenStatus, NEVER_EXPIRES};
    use crate::store::memory::MemoryStore;

    fn token(id: i64) -> Token {
        Token {
            id,
            account_id: 1,
            key: format!("{:0>48}", id),
            name: String::new(),
            status: TokenStatus::Enabled,
            created_at: 0,
            accessed_at: 0,
            expires_at: NEVER_EXPIRES,
            remaining_quota: 1_000,
            used_quota: 0,
            unlimited_quota: false,
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_entry() {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=25 {
            store.insert_token(token(id)).await;
        }
        store.fail_token(13).await;

        let persister = BatchPersister::new(store.clone(), 10);
        let entries: Vec<_> = (1..=25)
            .map(|id| PendingDelta { token_id: id, delta: id })
            .collect();
        let failed = persister.persist(entries).await;

        assert_eq!(failed, vec![PendingDelta { token_id: 13, delta: 13 }]);
        for id in (1..=25).filter(|id| *id != 13) {
            let t = store.token(id).await.unwrap();
            assert_eq!(t.used_quota, id);
            assert_eq!(t.remaining_quota, 1_000 - id);
        }
        assert_eq!(store.token(13).await.unwrap().used_quota, 0);
    }

    #[tokio::test]
    async fn test_negative_delta_credits_back() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token(token(1)).await;
        let persister = BatchPersister::new(store.clone(), 10);
        let failed = persister
            .persist(vec![PendingDelta { token_id: 1, delta: -40 }])
            .await;
        assert!(failed.is_empty());
        let t = store.token(1).await.unwrap();
        assert_eq!(t.remaining_quota, 1_040);
        assert_eq!(t.used_quota, -40);
    }

    #[tokio::test]
    async fn test_outage_returns_every_entry() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true).await;
        let persister = BatchPersister::new(store, 3);
        let entries: Vec<_> = (1..=7)
            .map(|id| PendingDelta { token_id: id, delta: 1 })
            .collect();
        let mut failed = persister.persist(entries.clone()).await;
        failed.sort_by_key(|e| e.token_id);
        assert_eq!(failed, entries);
    }
}
