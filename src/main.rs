//! gemdrive -- storage gateway serving several backends under one namespace.
//!
//! Crash-only design: every startup is a recovery. The token store compacts
//! itself on open and abandoned uploads leave only temp files behind.
//! SIGTERM/SIGINT stop accepting connections and wait with a timeout
//! before exiting.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use gemdrive::config::{Config, LoggingConfig, MountConfig};

/// Command-line arguments for the gemdrive server.
#[derive(Parser, Debug)]
#[command(name = "gemdrive", version, about = "Multi-backend storage gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to mount under its own name. Repeatable.
    #[arg(short, long = "dir")]
    dirs: Vec<PathBuf>,

    /// Override the image cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Override the token store directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(cache_dir) = self.cache_dir {
            config.storage.cache_dir = cache_dir;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        config
            .storage
            .mounts
            .extend(self.dirs.into_iter().map(MountConfig::local));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => gemdrive::config::load_config(path)?,
        None => Config::default(),
    };
    let config_source = cli.config.clone();
    cli.apply(&mut config);

    init_tracing(&config.logging);
    match config_source {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file given, using defaults"),
    }
    config.validate()?;

    if config.observability.metrics {
        gemdrive::metrics::init_metrics();
        gemdrive::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);

    let state = gemdrive::build_state(config)?;
    let app = gemdrive::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("gemdrive listening on {}", bind_addr);

    // Stop accepting on the first signal; give in-flight requests
    // `shutdown_timeout` to drain, then exit regardless.
    let notify = Arc::new(Notify::new());
    let trigger = notify.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { trigger.notified().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result?;
        }
        _ = shutdown_signal() => {
            notify.notify_one();
            if tokio::time::timeout(shutdown_timeout, &mut server).await.is_err() {
                warn!(
                    "In-flight requests still running after {}s, exiting",
                    shutdown_timeout.as_secs()
                );
            }
        }
    }

    info!("gemdrive shut down");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
