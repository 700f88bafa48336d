use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AlertKind, QuotaAlert, QuotaNotifier};

// ── Webhook Event Types ───────────────────────────────────────

/// A structured event payload sent to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// Event type identifier: "quota_low" or "quota_exhausted".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    pub account_id: i64,
    pub details: serde_json::Value,
}

impl WebhookEvent {
    pub fn from_alert(alert: &QuotaAlert) -> Self {
        let event_type = match alert.kind {
            AlertKind::ApproachingLimit => "quota_low",
            AlertKind::Exhausted => "quota_exhausted",
        };
        Self {
            event_type: event_type.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            account_id: alert.account_id,
            details: serde_json::json!({
                "message": alert.kind.message(),
                "remaining": alert.remaining,
                "cost": alert.cost,
            }),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns "sha256=<lowercase hex>".
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Delivers quota alerts to every configured URL.
/// Supports:
/// - HMAC-SHA256 signing (X-Quota-Signature header) when a secret is set
/// - Retries with back-off between attempts (default 0s → 1s → 5s → 25s)
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
    signing_secret: Option<String>,
    backoff: Vec<Duration>,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>, signing_secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("quota-meter-webhook/1.0")
            .build()?;
        Ok(Self {
            client,
            urls,
            signing_secret,
            backoff: [0, 1, 5, 25].iter().map(|s| Duration::from_secs(*s)).collect(),
        })
    }

    /// Override the delay before each attempt. The first entry is the delay
    /// before the first attempt (normally zero).
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send one event to one URL, retrying on network errors and non-2xx.
    pub async fn send(&self, url: &str, event: &WebhookEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let signature = match &self.signing_secret {
            Some(s) => Some(hmac_sha256_hex(s, &payload)?),
            None => None,
        };

        for (attempt, delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                debug!(url, attempt, ?delay, event_type = %event.event_type, "retrying webhook delivery");
                tokio::time::sleep(*delay).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-quota-delivery-id", &delivery_id)
                .header("x-quota-event", &event.event_type);
            if let Some(ref sig) = signature {
                req = req.header("x-quota-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        url,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivery failed (non-2xx)"
                    );
                }
                Err(e) => {
                    warn!(url, delivery_id = %delivery_id, attempt, error = %e, "webhook request error");
                }
            }
        }

        anyhow::bail!(
            "webhook delivery to {} failed after {} attempts",
            url,
            self.backoff.len()
        )
    }
}

#[async_trait]
impl QuotaNotifier for WebhookNotifier {
    /// Each URL is attempted independently; one failing endpoint does not
    /// stop delivery to the others.
    async fn notify(&self, alert: QuotaAlert) -> Result<()> {
        let event = WebhookEvent::from_alert(&alert);
        let results = join_all(self.urls.iter().map(|url| self.send(url, &event))).await;
        let mut failed = 0usize;
        for (url, result) in self.urls.iter().zip(results) {
            if let Err(e) = result {
                warn!(url = %url, error = %e, "quota alert webhook ultimately failed");
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} webhook deliveries failed", failed, self.urls.len());
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────
