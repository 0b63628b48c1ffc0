// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Duet Relay Server
//!
//! Routes chat messages between identities over WebSocket. Every message is
//! stored before it is pushed, so offline recipients read it later.
//! Provides:
//! - WebSocket endpoint at `/ws/<handle>`
//! - HTTP endpoints for health checks and Prometheus metrics
//! - Per-identity rate limiting and a global connection cap

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use duet_core::{
    create_message_store, DirectoryError, IdentityDirectory, MemoryIdentityDirectory,
    MessageStore, SessionManager, SqliteIdentityDirectory, StoreLocation,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use duet_relay::config::RelayConfig;
use duet_relay::connection_limit::ConnectionLimiter;
use duet_relay::handler::RelayContext;
use duet_relay::http::{create_router, HttpState};
use duet_relay::metrics::RelayMetrics;
use duet_relay::rate_limit::RateLimiter;

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "duet_relay=info"
                    .parse()
                    .unwrap_or_else(|_| tracing::level_filters::LevelFilter::INFO.into()),
            ),
        )
        .init();

    if let Err(e) = run(RelayConfig::from_env()).await {
        error!("Relay failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: RelayConfig) -> Result<(), BoxError> {
    info!("Starting Duet Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("HTTP (health/metrics): {}", config.http_addr());
    info!("Store: {:?}", config.store);

    let metrics = RelayMetrics::new()?;
    let store: Arc<dyn MessageStore> =
        Arc::from(create_message_store(&config.store, config.store_timeout)?);
    let directory = open_directory(&config)?;
    for handle in &config.seed_handles {
        match directory.register(handle) {
            Ok(identity) => info!("Seeded handle {} ({})", handle, identity.id()),
            Err(DirectoryError::AlreadyRegistered(_)) => {}
            Err(e) => error!("Could not seed handle {}: {}", handle, e),
        }
    }

    let manager = Arc::new(SessionManager::new(
        directory,
        store,
        config.relay_options(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
    let connection_limiter = ConnectionLimiter::new(config.max_connections);

    let http_state = HttpState {
        metrics: metrics.clone(),
        manager: manager.clone(),
        start_time: Instant::now(),
        metrics_token: config.metrics_token.clone(),
    };
    let http_listener = TcpListener::bind(config.http_addr()).await?;
    let http_addr = config.http_addr();
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, create_router(http_state)).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    // Remove rate limiter buckets for identities idle for 30 minutes.
    let cleanup_rate_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(600)).await;
            let removed = cleanup_rate_limiter.cleanup_inactive(Duration::from_secs(1800));
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    let ctx = Arc::new(RelayContext {
        manager: manager.clone(),
        rate_limiter,
        metrics,
        max_message_size: config.max_message_size,
        history_max: config.history_max,
        auto_register: config.auto_register,
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("WebSocket server listening on {}", config.listen_addr);

    tokio::select! {
        _ = duet_relay::serve(listener, ctx, connection_limiter) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
    }
    manager.shutdown().await;
    Ok(())
}

/// Opens the identity directory beside the message store.
fn open_directory(config: &RelayConfig) -> Result<Arc<dyn IdentityDirectory>, BoxError> {
    Ok(match &config.store {
        StoreLocation::Memory => Arc::new(MemoryIdentityDirectory::new()),
        StoreLocation::Sqlite(path) => Arc::new(SqliteIdentityDirectory::open(path)?),
    })
}
