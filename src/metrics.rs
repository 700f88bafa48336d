//! Prometheus metrics for the quota engine.
//!
//! All metrics live in the global default registry and are registered once,
//! on first use. `/metrics` renders them with [`render`].

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

pub struct QuotaMetrics {
    /// Guard calls by operation (pre / post) and outcome (ok / error code).
    pub consume_total: IntCounterVec,
    /// Flushed entries by result (persisted / failed / dropped).
    pub flush_entries_total: IntCounterVec,
    pub flush_duration_seconds: Histogram,
    /// Tokens with an accumulated or parked, unflushed delta.
    pub pending_tokens: IntGauge,
    pub intake_events_total: IntCounter,
}

static METRICS: Lazy<QuotaMetrics> = Lazy::new(|| QuotaMetrics {
    consume_total: register_int_counter_vec!(
        opts!("quota_consume_total", "Quota guard calls by operation and outcome"),
        &["op", "outcome"]
    )
    .expect("failed to register quota_consume_total"),
    flush_entries_total: register_int_counter_vec!(
        opts!("quota_flush_entries_total", "Flushed usage deltas by result"),
        &["result"]
    )
    .expect("failed to register quota_flush_entries_total"),
    flush_duration_seconds: register_histogram!(histogram_opts!(
        "quota_flush_duration_seconds",
        "Wall time of one drain-and-persist cycle",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    ))
    .expect("failed to register quota_flush_duration_seconds"),
    pending_tokens: register_int_gauge!(opts!(
        "quota_pending_tokens",
        "Tokens with unflushed usage deltas"
    ))
    .expect("failed to register quota_pending_tokens"),
    intake_events_total: register_int_counter!(opts!(
        "quota_intake_events_total",
        "Usage deltas applied by the intake consumer"
    ))
    .expect("failed to register quota_intake_events_total"),
});

pub fn metrics() -> &'static QuotaMetrics {
    &METRICS
}

/// Encode the default registry in the Prometheus text format.
pub fn render() -> String {
    // touch the lazy so the families exist even before first use
    let _ = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::error!("failed to encode metrics: {}", e);
    }
    String::from_utf8(buf).unwrap_or_default()
}
