// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Configuration
//!
//! Read from `DUET_*` environment variables. Invalid values fall back to
//! their defaults with a warning.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use duet_core::{RelayOptions, StoreLocation};
use tracing::warn;

const DEFAULT_HTTP_PORT: u16 = 8081;
const DEFAULT_STORE: &str = "sqlite://data/duet.db";
const DEFAULT_MAX_CONNECTIONS: usize = 1000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
const DEFAULT_RATE_LIMIT: u32 = 120;
const DEFAULT_PUSH_TIMEOUT_MS: u64 = 5000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_HISTORY_MAX: usize = 200;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// Port for health and metrics, on the same host as `listen_addr`.
    pub http_port: u16,
    /// Message store location.
    pub store: StoreLocation,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Messages per minute allowed per identity.
    pub rate_limit_per_min: u32,
    pub push_timeout: Duration,
    pub store_timeout: Duration,
    /// Largest history page a client may request.
    pub history_max: usize,
    /// Register unknown handles on connect (development only).
    pub auto_register: bool,
    /// Handles registered at startup.
    pub seed_handles: Vec<String>,
    /// Bearer token required for `/metrics`, if set.
    pub metrics_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_port: DEFAULT_HTTP_PORT,
            store: StoreLocation::Sqlite("data/duet.db".into()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rate_limit_per_min: DEFAULT_RATE_LIMIT,
            push_timeout: Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            history_max: DEFAULT_HISTORY_MAX,
            auto_register: false,
            seed_handles: Vec::new(),
            metrics_token: None,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RelayConfig::default();
        let store = match lookup("DUET_STORE") {
            Some(value) => StoreLocation::parse(&value).unwrap_or_else(|e| {
                warn!("Invalid DUET_STORE {:?} ({}), using {}", value, e, DEFAULT_STORE);
                defaults.store.clone()
            }),
            None => defaults.store.clone(),
        };

        RelayConfig {
            listen_addr: parse_or(&lookup, "DUET_LISTEN_ADDR", defaults.listen_addr),
            http_port: parse_or(&lookup, "DUET_HTTP_PORT", DEFAULT_HTTP_PORT),
            store,
            max_connections: positive_or(&lookup, "DUET_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            max_message_size: positive_or(
                &lookup,
                "DUET_MAX_MESSAGE_SIZE",
                DEFAULT_MAX_MESSAGE_SIZE,
            ),
            rate_limit_per_min: positive_or(&lookup, "DUET_RATE_LIMIT", DEFAULT_RATE_LIMIT),
            push_timeout: Duration::from_millis(positive_or(
                &lookup,
                "DUET_PUSH_TIMEOUT_MS",
                DEFAULT_PUSH_TIMEOUT_MS,
            )),
            store_timeout: Duration::from_millis(positive_or(
                &lookup,
                "DUET_STORE_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT_MS,
            )),
            history_max: positive_or(&lookup, "DUET_HISTORY_MAX", DEFAULT_HISTORY_MAX),
            auto_register: parse_or(&lookup, "DUET_AUTO_REGISTER", false),
            seed_handles: lookup("DUET_SEED_HANDLES")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            metrics_token: lookup("DUET_METRICS_TOKEN").filter(|t| !t.is_empty()),
        }
    }

    /// Address of the health/metrics listener.
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr.ip(), self.http_port)
    }

    /// Session manager options derived from this configuration.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            push_timeout: self.push_timeout,
            store_timeout: self.store_timeout,
            ..RelayOptions::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {} {:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}

fn positive_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + Copy,
{
    let value = parse_or(lookup, key, default);
    if value <= T::default() {
        warn!("{} must be positive, using default", key);
        default
    } else {
        value
    }
}
