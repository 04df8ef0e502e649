use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{BackendKind, LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::http::{router, Admission, AppState, HttpServer};
use turnstile::ratelimit::{
    AdmissionBackend, DistributedLimiter, KeyStrategy, LocalLimiter, LocalRegistry,
    MetricsEvents, RedisStore,
};

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Token-bucket admission control in front of a demo HTTP API.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overriding the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Redis URL, overriding the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Limiter backend, overriding the configuration
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(redis_url) = args.redis_url {
        config.limiter.redis_url = redis_url;
    }
    if let Some(backend) = args.backend {
        config.limiter.backend = backend;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.limiter.backend,
        "Configuration loaded"
    );

    let backend = build_backend(&config).await;
    info!(backend = backend.name(), "Rate limiter initialized");

    let metrics = PrometheusBuilder::new().install_recorder()?;
    MetricsEvents::describe();
    let events = Arc::new(MetricsEvents);
    let default = Admission::new(
        backend.clone(),
        KeyStrategy::ClientRoute,
        config.policies.default,
    )
    .with_bypass(config.bypass.clone())
    .with_events(events.clone())
    .with_body_limit(config.server.body_limit_bytes);
    let login = Admission::new(backend, KeyStrategy::login(), config.policies.login)
        .with_events(events)
        .with_body_limit(config.server.body_limit_bytes);

    let app = router(AppState { metrics }, default, login);
    HttpServer::new(config.server.listen_addr, app)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Build the configured backend, falling back to the local registry when Redis is unreachable.
async fn build_backend(config: &TurnstileConfig) -> Arc<dyn AdmissionBackend> {
    let limiter = &config.limiter;
    let local_ttl = config.policies.local_ttl();
    let local = || -> Arc<dyn AdmissionBackend> {
        Arc::new(LocalLimiter::new(LocalRegistry::new(local_ttl)))
    };

    if limiter.backend == BackendKind::Local {
        return local();
    }

    match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, RedisStore::connect(&limiter.redis_url)).await
    {
        Ok(Ok(store)) => {
            info!(url = %limiter.redis_url, "Connected to Redis");
            Arc::new(
                DistributedLimiter::new(Arc::new(store))
                    .with_key_prefix(limiter.key_prefix.clone())
                    .with_timeout(limiter.store_timeout()),
            )
        }
        Ok(Err(e)) => {
            warn!(url = %limiter.redis_url, error = %e, "Redis unavailable, using local buckets");
            local()
        }
        Err(_) => {
            warn!(
                url = %limiter.redis_url,
                timeout = ?REDIS_CONNECT_TIMEOUT,
                "Redis connection timed out, using local buckets"
            );
            local()
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
