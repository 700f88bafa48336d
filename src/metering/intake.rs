//! Bounded intake queue in front of the aggregator.
//!
//! Producers push events onto an mpsc channel; one consumer task applies them
//! to the [`DeltaAggregator`]. A full queue pushes back on producers instead
//! of dropping events.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::aggregator::DeltaAggregator;
use crate::errors::QuotaError;
use crate::metrics::metrics;
use crate::models::delta::PendingDelta;

pub(crate) enum IntakeMsg {
    Usage(PendingDelta),
    /// Acknowledged once everything queued before it has been applied.
    Barrier(oneshot::Sender<()>),
}

/// Cheaply-cloneable handle for recording token usage.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<IntakeMsg>,
}

impl UsageRecorder {
    /// Queue a usage delta, waiting for room if the queue is full.
    pub async fn record(&self, token_id: i64, delta: i64) -> Result<(), QuotaError> {
        self.tx
            .send(IntakeMsg::Usage(PendingDelta { token_id, delta }))
            .await
            .map_err(|_| QuotaError::IntakeClosed)
    }

    /// Queue a usage delta without waiting.
    pub fn try_record(&self, token_id: i64, delta: i64) -> Result<(), QuotaError> {
        match self.tx.try_send(IntakeMsg::Usage(PendingDelta { token_id, delta })) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QuotaError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(QuotaError::IntakeClosed),
        }
    }

    /// Resolve once every event recorded before this call is in the aggregator.
    pub async fn settle(&self) -> Result<(), QuotaError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(IntakeMsg::Barrier(ack_tx))
            .await
            .map_err(|_| QuotaError::IntakeClosed)?;
        ack_rx.await.map_err(|_| QuotaError::IntakeClosed)
    }
}

pub(crate) fn channel(capacity: usize) -> (UsageRecorder, mpsc::Receiver<IntakeMsg>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (UsageRecorder { tx }, rx)
}

fn apply(aggregator: &DeltaAggregator, msg: IntakeMsg) {
    match msg {
        IntakeMsg::Usage(entry) => {
            aggregator.add(entry.token_id, entry.delta);
            metrics().intake_events_total.inc();
        }
        IntakeMsg::Barrier(ack) => {
            let _ = ack.send(());
        }
    }
}

/// Spawn the single intake consumer. On shutdown it stops accepting new
/// events, applies everything already queued, and exits.
pub(crate) fn spawn_consumer(
    mut rx: mpsc::Receiver<IntakeMsg>,
    aggregator: Arc<DeltaAggregator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => apply(&aggregator, msg),
                    None => break,
                },
                _ = shutdown.changed() => {
                    rx.close();
                    while let Some(msg) = rx.recv().await {
                        apply(&aggregator, msg);
                    }
                    break;
                }
            }
        }
        debug!("usage intake consumer stopped");
    })
}
