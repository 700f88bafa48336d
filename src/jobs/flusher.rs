//! Background job: drain the usage aggregator and persist it.
//!
//! Runs every flush interval (500ms by default). Each cycle:
//! 1. Releases parked retries whose backoff has elapsed back into the aggregator.
//! 2. Drains the aggregator.
//! 3. Persists the drained deltas through the [`BatchPersister`].
//! 4. Requeues failures per the [`RetryPolicy`](crate::metering::retry::RetryPolicy).
//!
//! Cycles are serialized: a manual flush waits for a running periodic one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::metering::aggregator::DeltaAggregator;
use crate::metering::persister::BatchPersister;
use crate::metering::retry::RetryTracker;
use crate::metrics::metrics;

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Tokens drained from the aggregator.
    pub drained: usize,
    pub persisted: usize,
    /// Failed and merged straight back into the aggregator.
    pub requeued: usize,
    /// Failed and held back by backoff.
    pub parked: usize,
    /// Failed past the retry cap and discarded.
    pub dropped: usize,
}

impl FlushReport {
    /// Failed entries still on their way to the store.
    pub fn retrying(&self) -> usize {
        self.requeued + self.parked
    }
}

pub struct Flusher {
    aggregator: Arc<DeltaAggregator>,
    persister: BatchPersister,
    /// Held for a whole cycle.
    running: tokio::sync::Mutex<()>,
    /// Never held across an await.
    tracker: Mutex<RetryTracker>,
}

impl Flusher {
    pub fn new(
        aggregator: Arc<DeltaAggregator>,
        persister: BatchPersister,
        tracker: RetryTracker,
    ) -> Self {
        Self {
            aggregator,
            persister,
            running: tokio::sync::Mutex::new(()),
            tracker: Mutex::new(tracker),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, RetryTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Unpersisted delta for a token, parked retries included.
    pub fn pending_delta(&self, token_id: i64) -> i64 {
        self.aggregator
            .pending(token_id)
            .saturating_add(self.tracker().parked_delta(token_id))
    }

    /// Tokens with unpersisted usage, parked retries included.
    pub fn pending_tokens(&self) -> usize {
        let mut ids = self.aggregator.pending_ids();
        ids.extend(self.tracker().parked_ids());
        ids.len()
    }

    pub async fn run_cycle(&self) -> FlushReport {
        self.cycle(false).await
    }

    async fn cycle(&self, release_all: bool) -> FlushReport {
        let _running = self.running.lock().await;

        let released = {
            let mut tracker = self.tracker();
            if release_all {
                tracker.take_all()
            } else {
                tracker.take_due(Instant::now())
            }
        };
        self.aggregator.merge(&released);

        let drained = self.aggregator.drain();
        if drained.is_empty() {
            metrics().pending_tokens.set(self.pending_tokens() as i64);
            return FlushReport::default();
        }

        let timer = metrics().flush_duration_seconds.start_timer();
        let ids: Vec<i64> = drained.iter().map(|d| d.token_id).collect();
        let mut report = FlushReport {
            drained: drained.len(),
            ..FlushReport::default()
        };

        let failed = self.persister.persist(drained).await;
        timer.observe_duration();

        report.persisted = ids.len() - failed.len();
        let failed_ids: HashSet<i64> = failed.iter().map(|d| d.token_id).collect();
        let requeue = {
            let mut tracker = self.tracker();
            for id in ids.iter().filter(|id| !failed_ids.contains(id)) {
                tracker.record_success(*id);
            }
            tracker.record_failures(failed, Instant::now())
        };
        self.aggregator.merge(&requeue.immediate);
        report.requeued = requeue.immediate.len();
        report.parked = requeue.parked;
        report.dropped = requeue.dropped.len();
        for entry in &requeue.dropped {
            error!(
                token_id = entry.token_id,
                delta = entry.delta,
                "dropping token usage delta after max retry attempts"
            );
        }

        let m = metrics();
        m.flush_entries_total
            .with_label_values(&["persisted"])
            .inc_by(report.persisted as u64);
        m.flush_entries_total
            .with_label_values(&["failed"])
            .inc_by(report.retrying() as u64);
        m.flush_entries_total
            .with_label_values(&["dropped"])
            .inc_by(report.dropped as u64);
        m.pending_tokens.set(self.pending_tokens() as i64);

        debug!(?report, "flush cycle complete");
        report
    }

    /// Last cycle before exit: parked retries are released regardless of
    /// backoff. Whatever still fails is logged as lost.
    pub async fn final_flush(&self) -> FlushReport {
        let report = self.cycle(true).await;

        let mut lost = self.aggregator.drain();
        lost.extend(self.tracker().take_all());
        if !lost.is_empty() {
            warn!(count = lost.len(), "usage deltas could not be flushed before shutdown");
            for entry in &lost {
                error!(token_id = entry.token_id, delta = entry.delta, "unflushed token usage lost at shutdown");
            }
        }
        report
    }

    /// Spawn the periodic flush loop. It stops when `shutdown` flips; the
    /// caller is expected to run [`final_flush`](Self::final_flush) afterwards.
    pub fn spawn(self: Arc<Self>, interval_ms: u64, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_cycle().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("flusher stopped");
        })
    }
}
