// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::keys::new_suffix;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// QUIC bind address for the controller service.
    pub bind: SocketAddr,
    /// QUIC bind address for the ingress/verb service.
    pub ingress_bind: SocketAddr,
    /// This controller's key.
    pub key: String,
    /// Endpoint advertised to peers.
    pub advertise: String,
    /// Liveness heartbeat interval (runners and controllers).
    pub heartbeat_interval: Duration,
    /// Entities not seen for this long are marked dead.
    pub stale_timeout: Duration,
    /// Reconciler scan interval.
    pub reconcile_interval: Duration,
    /// Async-call executor poll interval.
    pub executor_poll_interval: Duration,
    /// Lease TTL taken on acquired async calls.
    pub async_call_lease: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TESSERA_CONTROLLER_DSN`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `TESSERA_BIND`: controller service bind address (default: 0.0.0.0:8892)
    /// - `TESSERA_INGRESS_BIND`: ingress service bind address (default: 0.0.0.0:8891)
    /// - `TESSERA_CONTROLLER_KEY`: stable controller key (default: generated)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TESSERA_CONTROLLER_DSN")
            .map_err(|_| ConfigError::Missing("TESSERA_CONTROLLER_DSN"))?;

        let bind: SocketAddr = std::env::var("TESSERA_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8892".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TESSERA_BIND", "must be a socket address"))?;

        let ingress_bind: SocketAddr = std::env::var("TESSERA_INGRESS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8891".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TESSERA_INGRESS_BIND", "must be a socket address")
            })?;

        let key = std::env::var("TESSERA_CONTROLLER_KEY")
            .unwrap_or_else(|_| format!("ctrl-{}", new_suffix()));

        Ok(Self {
            database_url,
            bind,
            ingress_bind,
            advertise: bind.to_string(),
            key,
            heartbeat_interval: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(1),
            executor_poll_interval: Duration::from_millis(500),
            async_call_lease: Duration::from_secs(10),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
