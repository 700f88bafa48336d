use crate::metering::retry::RetryPolicy;
use crate::metering::MeteringConfig;
use crate::quota::guard::GuardConfig;

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Optional second cache tier for token lookups by key.
    pub redis_url: Option<String>,
    /// Protects the status API when set.
    pub admin_key: Option<String>,
    /// Account remaining quota below which a low-balance alert is sent.
    /// Set via QUOTA_REMIND_THRESHOLD. Default: 1000.
    pub remind_threshold: i64,
    pub flush_interval_ms: u64,
    pub intake_capacity: usize,
    pub persist_batch_size: usize,
    pub retry: RetryPolicy,
    pub token_cache_ttl_secs: u64,
    /// Comma-separated list of webhook URLs notified on low balance.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: Option<String>,
}

impl Config {
    pub fn guard(&self) -> GuardConfig {
        GuardConfig {
            remind_threshold: self.remind_threshold,
        }
    }

    pub fn metering(&self) -> MeteringConfig {
        MeteringConfig {
            flush_interval_ms: self.flush_interval_ms,
            intake_capacity: self.intake_capacity,
            persist_batch_size: self.persist_batch_size,
            retry: self.retry.clone(),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = MeteringConfig::default();
    let retry_defaults = RetryPolicy::default();

    let cfg = Config {
        port: env_or("QUOTA_PORT", 8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/quota".into()),
        redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
        admin_key: std::env::var("QUOTA_ADMIN_KEY").ok().filter(|s| !s.is_empty()),
        remind_threshold: env_or("QUOTA_REMIND_THRESHOLD", GuardConfig::default().remind_threshold),
        flush_interval_ms: env_or("QUOTA_FLUSH_INTERVAL_MS", defaults.flush_interval_ms),
        intake_capacity: env_or("QUOTA_INTAKE_CAPACITY", defaults.intake_capacity),
        persist_batch_size: env_or("QUOTA_PERSIST_BATCH_SIZE", defaults.persist_batch_size),
        retry: RetryPolicy {
            max_attempts: std::env::var("QUOTA_RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            base_backoff_ms: env_or("QUOTA_RETRY_BASE_BACKOFF_MS", retry_defaults.base_backoff_ms),
            max_backoff_ms: env_or("QUOTA_RETRY_MAX_BACKOFF_MS", retry_defaults.max_backoff_ms),
            jitter_ms: env_or("QUOTA_RETRY_JITTER_MS", retry_defaults.jitter_ms),
        },
        token_cache_ttl_secs: env_or("QUOTA_TOKEN_CACHE_TTL_SECS", 60),
        webhook_urls: std::env::var("QUOTA_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        webhook_secret: std::env::var("QUOTA_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
    };

    if cfg.intake_capacity == 0 {
        anyhow::bail!("QUOTA_INTAKE_CAPACITY must be greater than zero");
    }
    if cfg.persist_batch_size == 0 {
        anyhow::bail!("QUOTA_PERSIST_BATCH_SIZE must be greater than zero");
    }
    if cfg.flush_interval_ms == 0 {
        anyhow::bail!("QUOTA_FLUSH_INTERVAL_MS must be greater than zero");
    }

    Ok(cfg)
}
