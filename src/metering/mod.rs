//! Write-coalescing usage pipeline.
//!
//! ```text
//! record() ─► intake queue ─► consumer ─► DeltaAggregator ─► Flusher ─► BatchPersister ─► store
//!                                               ▲                  │
//!                                               └── failed deltas ─┘
//! ```
//!
//! Usage deltas are summed per token in memory and written once per flush
//! interval. The account side of a charge is never deferred; it goes through
//! [`ConsumptionGuard`](crate::quota::ConsumptionGuard) directly.

pub mod aggregator;
pub mod intake;
pub mod persister;
pub mod retry;

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use crate::jobs::flusher::FlushReport;
pub use aggregator::DeltaAggregator;
pub use intake::UsageRecorder;
pub use persister::BatchPersister;

use crate::jobs::flusher::Flusher;
use crate::store::QuotaStore;
use retry::{RetryPolicy, RetryTracker};

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub flush_interval_ms: u64,
    pub intake_capacity: usize,
    /// Concurrent store writes per flush group.
    pub persist_batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            intake_capacity: 1000,
            persist_batch_size: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Running pipeline: intake consumer plus periodic flusher.
pub struct Metering {
    recorder: UsageRecorder,
    flusher: Arc<Flusher>,
    intake_shutdown: watch::Sender<bool>,
    flusher_shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Metering {
    /// Spawn the intake consumer and the flush loop. Must be called from
    /// inside a tokio runtime.
    pub fn start(store: Arc<dyn QuotaStore>, config: MeteringConfig) -> Self {
        let aggregator = Arc::new(DeltaAggregator::new());
        let (recorder, rx) = intake::channel(config.intake_capacity);
        let (intake_shutdown, intake_rx) = watch::channel(false);
        let (flusher_shutdown, flusher_rx) = watch::channel(false);

        let consumer = intake::spawn_consumer(rx, aggregator.clone(), intake_rx);
        let flusher = Arc::new(Flusher::new(
            aggregator.clone(),
            BatchPersister::new(store, config.persist_batch_size),
            RetryTracker::new(config.retry.clone()),
        ));
        let flush_loop = flusher.clone().spawn(config.flush_interval_ms, flusher_rx);

        info!(
            flush_interval_ms = config.flush_interval_ms,
            intake_capacity = config.intake_capacity,
            batch_size = config.persist_batch_size,
            "usage metering started"
        );

        Self {
            recorder,
            flusher,
            intake_shutdown,
            flusher_shutdown,
            tasks: Mutex::new(Some((consumer, flush_loop))),
        }
    }

    pub fn recorder(&self) -> UsageRecorder {
        self.recorder.clone()
    }

    /// Accumulated, not yet persisted delta for a token, including
    /// failed deltas parked by retry backoff.
    pub fn pending_delta(&self, token_id: i64) -> i64 {
        self.flusher.pending_delta(token_id)
    }

    pub fn pending_tokens(&self) -> usize {
        self.flusher.pending_tokens()
    }

    /// Settle the intake queue and run one flush cycle immediately.
    pub async fn flush_now(&self) -> FlushReport {
        if let Err(e) = self.recorder.settle().await {
            warn!(error = %e, "flushing without settling the intake queue");
        }
        self.flusher.run_cycle().await
    }

    /// Stop accepting usage, apply what is queued, then flush one last time.
    /// Later calls return an empty report.
    pub async fn shutdown(&self) -> FlushReport {
        let Some((consumer, flush_loop)) = self.tasks.lock().await.take() else {
            return FlushReport::default();
        };

        let _ = self.intake_shutdown.send(true);
        if let Err(e) = consumer.await {
            warn!(error = %e, "usage intake consumer ended abnormally");
        }

        let _ = self.flusher_shutdown.send(true);
        if let Err(e) = flush_loop.await {
            warn!(error = %e, "flush loop ended abnormally");
        }

        let report = self.flusher.final_flush().await;
        info!(?report, "usage metering stopped");
        report
    }
}
