// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Duet Relay Server
//!
//! WebSocket front end for [`duet_core::SessionManager`]: clients connect at
//! `/ws/<handle>`, send chat frames and receive pushes for their identity.
//! Health and Prometheus metrics are served over HTTP on a second port.

pub mod config;
pub mod connection_limit;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod session;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, warn};
use uuid::Uuid;

use connection_limit::ConnectionLimiter;
use handler::RelayContext;

/// Accepts WebSocket connections on `listener` until it fails.
///
/// Connections beyond the limiter's capacity are dropped before the
/// handshake.
pub async fn serve(listener: TcpListener, ctx: Arc<RelayContext>, limiter: ConnectionLimiter) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                return;
            }
        };

        let Some(guard) = limiter.try_acquire() else {
            warn!(
                "Connection rejected from {}: at max capacity ({}/{})",
                addr,
                limiter.active_count(),
                limiter.max()
            );
            ctx.metrics.connection_errors.inc();
            drop(stream);
            continue;
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let connection = Uuid::new_v4();
            debug!("Accepted {} from {}", connection, addr);
            handler::handle_connection(stream, ctx, connection).await;
        });
    }
}
