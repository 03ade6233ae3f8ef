//! keyward daemon
//!
//! Serves the key and connection lifecycle API on a local address and runs
//! the background storage refresher.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kw_core::config::{self, DaemonConfig};
use kw_daemon::executor::SshExecutor;
use kw_daemon::lifecycle::run_storage_refresher;
use kw_daemon::{create_router, LifecycleManager};

#[derive(Parser)]
#[command(name = "kw-daemon")]
#[command(about = "keyward system SSH key daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Data directory for state and key material (overrides config)
    #[arg(long, env = "KEYWARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("keyward daemon starting...");

    // Load configuration
    let mut config: DaemonConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                DaemonConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            DaemonConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let executor = Arc::new(SshExecutor::new(config.connect_timeout));
    let manager = Arc::new(
        LifecycleManager::open(config.clone(), executor)
            .with_context(|| format!("Failed to open state in {:?}", config.data_dir))?,
    );

    if let Some(key) = manager.system_key().await {
        tracing::info!("System key {}: {} ({})", key.id, key.key_type, key.fingerprint);
    } else {
        tracing::info!("No system key configured yet");
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    // Spawn the background storage refresher
    let refresher = if config.auto_refresh_storage {
        Some(tokio::spawn(run_storage_refresher(
            Arc::clone(&manager),
            config.storage_refresh_interval,
            cancel.clone(),
        )))
    } else {
        tracing::info!("Automatic storage refresh disabled");
        None
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!("Serving API on http://{}", listener.local_addr()?);

    let router = create_router(Arc::clone(&manager));
    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    cancel.cancel();
    if let Some(refresher) = refresher {
        let _ = refresher.await;
    }

    tracing::info!("keyward daemon shutdown complete");
    Ok(())
}
