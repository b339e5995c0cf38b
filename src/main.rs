//! Gloom Server - Authoritative tile-arena multiplayer game server
//!
//! Entry point. It serves:
//! - WebSocket connections for real-time gameplay
//! - HTTP endpoints to create and join matches
//! - Background persistence of player stats

mod app;
mod config;
mod game;
mod http;
mod store;
mod util;
mod ws;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::store::{run_stats_writer, RestClient, StatsRecorder};
use crate::util::time::init_server_time;

/// Time given to running matches to save stats and say goodbye
const MATCH_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Time given to the stats writer to flush what is queued
const STATS_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    init_tracing(&config.log_level, config.log_json);
    init_server_time();

    info!("Starting Gloom Server");
    info!(
        addr = %config.server_addr,
        tick_rate = config.tick_rate,
        "Server configuration loaded"
    );

    let store = config
        .store_url
        .as_deref()
        .map(|url| RestClient::new(url, &config.store_service_key));
    if store.is_none() {
        warn!("STORE_URL not set, maps are built-in only and stats are logged");
    }

    let (stats, stats_rx) = StatsRecorder::channel();
    let stats_writer = tokio::spawn(run_stats_writer(stats_rx, store.clone()));

    let state = AppState::new(config.clone(), store, stats)?;
    let registry = state.registry.clone();

    let router = build_router(state);

    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Matches hold the last stats senders, the writer ends once they are gone
    registry.shutdown_all(MATCH_SHUTDOWN_TIMEOUT).await;
    drop(registry);

    match tokio::time::timeout(STATS_FLUSH_TIMEOUT, stats_writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Stats writer failed"),
        Err(_) => warn!("Timed out flushing player stats"),
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
