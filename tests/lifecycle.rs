//! A metered request from key validation to persisted usage.

mod common;

use std::sync::Arc;

use common::{store_with, token, RecordingNotifier, ACCOUNT_ID};
use quota_meter::cache::TokenCache;
use quota_meter::errors::QuotaError;
use quota_meter::metering::{Metering, MeteringConfig};
use quota_meter::models::token::TokenStatus;
use quota_meter::quota::{ConsumptionGuard, GuardConfig, TokenValidator};

#[tokio::test]
async fn test_request_lifecycle() {
    let t = token(1, 1_000);
    let key = t.key.clone();
    let store = store_with(5_000, vec![t]).await;

    let validator = TokenValidator::new(store.clone(), TokenCache::local_only(), 60);
    let guard = ConsumptionGuard::new(
        store.clone(),
        Arc::new(RecordingNotifier::default()),
        GuardConfig::default(),
    );
    let metering = Metering::start(
        store.clone(),
        MeteringConfig {
            flush_interval_ms: 3_600_000,
            ..MeteringConfig::default()
        },
    );

    // admit with an estimate, then settle the account side on the real cost
    let admitted = validator.validate_key(&key).await.unwrap();
    guard.pre_consume(admitted.id, 100).await.unwrap();
    guard.reconcile(admitted.id, 100, 70).await.unwrap();

    // high-rate per-token usage goes through the coalescing path
    let recorder = metering.recorder();
    for _ in 0..10 {
        recorder.record(admitted.id, 3).await.unwrap();
    }
    metering.flush_now().await;

    let t = store.token(1).await.unwrap();
    assert_eq!(t.used_quota, 70 + 30);
    assert_eq!(t.remaining_quota, 1_000 - 100);
    let a = store.account(ACCOUNT_ID).await.unwrap();
    assert_eq!(a.used, 70);
    assert_eq!(a.remaining, 4_930);
    metering.shutdown().await;
}

#[tokio::test]
async fn test_drained_token_is_refused_on_next_validation() {
    let t = token(1, 50);
    let key = t.key.clone();
    let store = store_with(5_000, vec![t]).await;

    let validator = TokenValidator::new(store.clone(), TokenCache::local_only(), 0);
    let guard = ConsumptionGuard::new(
        store.clone(),
        Arc::new(RecordingNotifier::default()),
        GuardConfig::default(),
    );

    validator.validate_key(&key).await.unwrap();
    guard.pre_consume(1, 50).await.unwrap();

    let err = validator.validate_key(&key).await.unwrap_err();
    assert!(matches!(err, QuotaError::Exhausted));
    assert_eq!(store.token(1).await.unwrap().status, TokenStatus::Exhausted);
}
