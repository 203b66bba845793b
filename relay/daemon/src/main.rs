//! Relay Daemon
//!
//! HTTP server exposing resumable streams.
//!
//! # Usage
//!
//! ```bash
//! # Resumability disabled (no pub/sub URL): turns are still served
//! relay-daemon
//!
//! # With Redis pub/sub and an Upstash registry
//! REDIS_URL=redis://localhost:6379 \
//! UPSTASH_REDIS_REST_URL=https://... UPSTASH_REDIS_REST_TOKEN=... \
//! relay-daemon --listen 0.0.0.0:8787
//!
//! # With verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `REDIS_URL` / `KV_URL`: pub/sub connection URL
//! - `UPSTASH_REDIS_REST_URL` / `KV_REST_API_URL`: registry endpoint
//! - `UPSTASH_REDIS_REST_TOKEN` / `KV_REST_API_TOKEN`: registry token
//! - `RELAY_LISTEN_ADDR`: listen address (default `127.0.0.1:8787`)
//! - `RELAY_CONFIG`: config file (default `$XDG_CONFIG_HOME/resumable-relay/relay.toml`)
//! - `RUST_LOG`: log filter
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: graceful shutdown (in-flight streams are drained)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use relay_core::config::{default_config_path, load_config_from_path};
use relay_core::{ConfigOverrides, ConnectionSupervisor, StreamContextFactory};
use relay_daemon::{router, AppState};

/// Resumable stream relay daemon
#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about)]
struct Args {
    /// Configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config and RELAY_LISTEN_ADDR)
    #[arg(long)]
    listen: Option<String>,

    /// Pub/sub URL (overrides config and REDIS_URL)
    #[arg(long)]
    pubsub_url: Option<String>,

    /// Retry a permanently failed pub/sub pair after this many seconds
    #[arg(long)]
    reprobe_after_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("relay_daemon=info,relay_core=info")
            }),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut settings = load_config_from_path(config_path.as_deref())
        .context("failed to load configuration")?;

    let overrides = ConfigOverrides {
        pubsub_url: args.pubsub_url,
        listen_addr: args.listen,
        reprobe_after_secs: args.reprobe_after_secs,
    };
    overrides
        .apply(&mut settings)
        .context("invalid command-line override")?;

    info!(
        source = %settings.source(),
        pubsub = settings.pubsub.url.is_some(),
        registry = settings.registry.rest_url.is_some(),
        "Starting relay daemon"
    );

    let supervisor = Arc::new(ConnectionSupervisor::redis(settings.supervisor_config()));
    let registry = Arc::new(
        settings
            .build_registry()
            .context("failed to build registry client")?,
    );
    let factory = Arc::new(StreamContextFactory::new(
        supervisor.clone(),
        settings.relay.clone(),
    ));
    let state = Arc::new(AppState::new(supervisor, registry, factory));

    let addr = settings.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Ready to accept connections");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
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
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
