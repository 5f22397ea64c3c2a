use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratesync::config::{LoggingConfig, ServiceConfig, StoreBackend};
use ratesync::http::HttpServer;
use ratesync::{InstanceId, LimiterManager, MemoryStore, RateLimitService, RedisStore, StoreGateway};

/// Distributed rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "ratesync", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address, overrides the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Redis connection URL, overrides the configuration
    #[arg(long, conflicts_with = "memory")]
    redis_url: Option<String>,

    /// Use the process-local store instead of Redis
    #[arg(long)]
    memory: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(url) = &self.redis_url {
            config.store.backend = StoreBackend::Redis;
            config.store.redis_url = url.clone();
        }
        if self.memory {
            config.store.backend = StoreBackend::Memory;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServiceConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_tracing(&config.logging);

    info!("Starting ratesync");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn StoreGateway> = match config.store.backend {
        StoreBackend::Redis => {
            info!(url = %config.store.redis_url, "Connecting to Redis");
            Arc::new(RedisStore::connect(&config.store.redis_url).await?)
        }
        StoreBackend::Memory => {
            warn!("Using the in-process store, state is not shared between instances");
            Arc::new(MemoryStore::new())
        }
    };

    let instance = InstanceId::generate();
    info!(instance = %instance, "Instance identity assigned");

    let manager = Arc::new(LimiterManager::new(store, instance));
    manager.spawn_reconciler(config.limiter.reconcile_interval());

    let service = Arc::new(RateLimitService::new(manager.clone()));
    HttpServer::new(config.server.listen_addr, service)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("ratesync stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
