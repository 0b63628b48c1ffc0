// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics
//!
//! Counters and gauges for the relay, exported at `/metrics`.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::error;

/// Relay metrics.
///
/// Cheap to clone; clones share the same underlying collectors.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub connection_errors: IntCounter,
    pub messages_received: IntCounter,
    pub messages_delivered: IntCounter,
    /// Stored without a confirmed push (recipient offline or push failed).
    pub messages_deferred: IntCounter,
    pub send_failures: IntCounter,
    pub sessions_superseded: IntCounter,
    pub rate_limited: IntCounter,
    pub messages_stored: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        Ok(RelayMetrics {
            connections_total: counter(
                "duet_connections_total",
                "Total WebSocket connections accepted",
            )?,
            connections_active: gauge(
                "duet_connections_active",
                "Currently open WebSocket connections",
            )?,
            connection_errors: counter(
                "duet_connection_errors_total",
                "Connections rejected or failed during handshake",
            )?,
            messages_received: counter(
                "duet_messages_received_total",
                "Chat messages accepted and stored",
            )?,
            messages_delivered: counter(
                "duet_messages_delivered_total",
                "Messages pushed to a live recipient and marked delivered",
            )?,
            messages_deferred: counter(
                "duet_messages_deferred_total",
                "Messages stored for later delivery",
            )?,
            send_failures: counter(
                "duet_send_failures_total",
                "Chat submissions rejected or not stored",
            )?,
            sessions_superseded: counter(
                "duet_sessions_superseded_total",
                "Sessions closed because the identity connected again",
            )?,
            rate_limited: counter(
                "duet_rate_limited_total",
                "Frames dropped by the rate limiter",
            )?,
            messages_stored: gauge("duet_messages_stored", "Messages in the store")?,
            registry,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
