//! Quota accounting and write-coalescing usage metering for API tokens.
//!
//! [`quota::ConsumptionGuard`] performs strongly-consistent charges against a
//! token and its owning account. [`metering::Metering`] absorbs high-rate token
//! usage, sums it per token in memory, and persists it in periodic batches.

use std::sync::Arc;

pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metering;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod quota;
pub mod store;

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub store: Arc<dyn store::QuotaStore>,
    pub metering: Arc<metering::Metering>,
    pub validator: quota::TokenValidator,
    pub admin_key: Option<String>,
}
