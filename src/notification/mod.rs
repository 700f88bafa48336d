pub mod webhook;

use async_trait::async_trait;
use serde::Serialize;

/// Which low-balance condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The debit took the account below the warning threshold.
    ApproachingLimit,
    /// The debit took the account to zero or below.
    Exhausted,
}

impl AlertKind {
    pub fn message(self) -> &'static str {
        match self {
            AlertKind::ApproachingLimit => "your quota is about to run out",
            AlertKind::Exhausted => "your quota has run out",
        }
    }
}

/// Low-balance alert for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaAlert {
    pub account_id: i64,
    pub kind: AlertKind,
    /// Account remaining quota observed before the debit.
    pub remaining: i64,
    /// Amount debited by the request that crossed the threshold.
    pub cost: i64,
}

impl QuotaAlert {
    /// Decide whether debiting `cost` from `remaining` crosses the warning
    /// threshold downward or reaches zero.
    pub fn for_debit(account_id: i64, remaining: i64, cost: i64, threshold: i64) -> Option<Self> {
        let after = remaining - cost;
        let too_low = remaining >= threshold && after < threshold;
        let none_left = after <= 0;
        let kind = if none_left {
            AlertKind::Exhausted
        } else if too_low {
            AlertKind::ApproachingLimit
        } else {
            return None;
        };
        Some(Self {
            account_id,
            kind,
            remaining,
            cost,
        })
    }
}

/// Delivery channel for low-balance alerts.
/// Implementations: WebhookNotifier, LogNotifier.
///
/// Callers invoke this from a detached task; errors are logged, never
/// propagated to the consuming request.
#[async_trait]
pub trait QuotaNotifier: Send + Sync {
    async fn notify(&self, alert: QuotaAlert) -> anyhow::Result<()>;
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl QuotaNotifier for LogNotifier {
    async fn notify(&self, alert: QuotaAlert) -> anyhow::Result<()> {
        tracing::info!(
            account_id = alert.account_id,
            kind = ?alert.kind,
            remaining = alert.remaining,
            "{}",
            alert.kind.message()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossing_threshold_warns() {
        let alert = QuotaAlert::for_debit(1, 1200, 300, 1000).unwrap();
        assert_eq!(alert.kind, AlertKind::ApproachingLimit);
        assert_eq!(alert.remaining, 1200);
    }

    #[test]
    fn test_already_below_threshold_is_silent() {
        assert!(QuotaAlert::for_debit(1, 900, 100, 1000).is_none());
    }

    #[test]
    fn test_staying_above_threshold_is_silent() {
        assert!(QuotaAlert::for_debit(1, 5000, 100, 1000).is_none());
    }

    #[test]
    fn test_reaching_zero_is_exhausted() {
        let alert = QuotaAlert::for_debit(1, 100, 100, 1000).unwrap();
        assert_eq!(alert.kind, AlertKind::Exhausted);
        // exhaustion wins over the threshold warning
        let alert = QuotaAlert::for_debit(1, 1000, 1000, 1000).unwrap();
        assert_eq!(alert.kind, AlertKind::Exhausted);
    }
}
