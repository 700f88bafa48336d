use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quota_meter::cache::TokenCache;
use quota_meter::config::{self, Config};
use quota_meter::metering::Metering;
use quota_meter::notification::webhook::WebhookNotifier;
use quota_meter::notification::{LogNotifier, QuotaNotifier};
use quota_meter::quota::{ConsumptionGuard, TokenValidator};
use quota_meter::store::postgres::PgStore;
use quota_meter::store::QuotaStore;
use quota_meter::{api, jobs, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_tracing()?;
    let cfg = config::load()?;

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
        Some(cli::Commands::Token { command }) => handle_token_command(command, &cfg).await,
        Some(cli::Commands::Quota { command }) => handle_quota_command(command, &cfg).await,
        Some(cli::Commands::Account { command }) => handle_account_command(command, &cfg).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

/// fmt layer plus an OTLP exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "quotad"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "quota_meter=debug,quotad=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn connect_store(cfg: &Config) -> anyhow::Result<PgStore> {
    tracing::info!("Connecting to database...");
    PgStore::connect(&cfg.database_url).await
}

async fn connect_cache(cfg: &Config) -> anyhow::Result<TokenCache> {
    let Some(url) = cfg.redis_url.as_deref() else {
        return Ok(TokenCache::local_only());
    };
    tracing::info!("Connecting to Redis...");
    let client = redis::Client::open(url).context("invalid REDIS_URL")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to redis")?;
    Ok(TokenCache::new(Some(conn)))
}

fn build_notifier(cfg: &Config) -> anyhow::Result<Arc<dyn QuotaNotifier>> {
    if cfg.webhook_urls.is_empty() {
        return Ok(Arc::new(LogNotifier));
    }
    let notifier = WebhookNotifier::new(cfg.webhook_urls.clone(), cfg.webhook_secret.clone())?;
    Ok(Arc::new(notifier))
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let db = connect_store(&cfg).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;
    let store: Arc<dyn QuotaStore> = Arc::new(db);

    let cache = connect_cache(&cfg).await?;
    jobs::cache_sweep::spawn(cache.clone());
    let validator = TokenValidator::new(store.clone(), cache, cfg.token_cache_ttl_secs);

    let metering = Arc::new(Metering::start(store.clone(), cfg.metering()));

    let state = Arc::new(AppState {
        store,
        metering: metering.clone(),
        validator,
        admin_key: cfg.admin_key.clone(),
    });
    if state.admin_key.is_none() {
        tracing::warn!("QUOTA_ADMIN_KEY is not set; the status API is unauthenticated");
    }

    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("quotad listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, flushing pending usage...");
    let report = metering.shutdown().await;
    tracing::info!(
        persisted = report.persisted,
        retrying = report.retrying(),
        dropped = report.dropped,
        "final flush complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn handle_token_command(cmd: cli::TokenCommands, cfg: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn QuotaStore> = Arc::new(connect_store(cfg).await?);
    match cmd {
        cli::TokenCommands::Show { id } => {
            let Some(t) = store.get_token(id).await? else {
                anyhow::bail!("token {} not found", id);
            };
            println!(
                "Token:\n  ID:         {}\n  Name:       {}\n  Account:    {}\n  Status:     {:?}\n  Remaining:  {}\n  Used:       {}\n  Unlimited:  {}\n  Expires at: {}",
                t.id,
                t.name,
                t.account_id,
                t.status,
                t.remaining_quota,
                t.used_quota,
                t.unlimited_quota,
                t.expires_at
            );
        }
        cli::TokenCommands::Validate { key } => {
            let cache = connect_cache(cfg).await?;
            let validator = TokenValidator::new(store, cache, cfg.token_cache_ttl_secs);
            match validator.validate_key(&key).await {
                Ok(t) => println!("Token {} is valid (remaining: {})", t.id, t.remaining_quota),
                Err(e) => println!("Token rejected: {} ({})", e, e.code()),
            }
        }
    }
    Ok(())
}

async fn handle_quota_command(cmd: cli::QuotaCommands, cfg: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn QuotaStore> = Arc::new(connect_store(cfg).await?);
    let guard = ConsumptionGuard::new(store, build_notifier(cfg)?, cfg.guard());
    match cmd {
        cli::QuotaCommands::PreConsume { token_id, amount } => {
            guard.pre_consume(token_id, amount).await?;
            println!("Reserved {} quota for token {}", amount, token_id);
        }
        cli::QuotaCommands::PostConsume { token_id, amount } => {
            guard.post_consume(token_id, amount).await?;
            println!("Adjusted token {} by {}", token_id, amount);
        }
    }
    Ok(())
}

async fn handle_account_command(cmd: cli::AccountCommands, cfg: &Config) -> anyhow::Result<()> {
    let store = connect_store(cfg).await?;
    match cmd {
        cli::AccountCommands::Show { id } => {
            let Some(a) = store.get_account_quota(id).await? else {
                anyhow::bail!("account {} not found", id);
            };
            println!(
                "Account:\n  ID:        {}\n  Remaining: {}\n  Used:      {}",
                a.account_id, a.remaining, a.used
            );
        }
    }
    Ok(())
}
