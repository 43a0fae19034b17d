// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-process cache of RPC clients, keyed by endpoint.
//!
//! Built at startup and read-mostly afterwards; connections are established
//! lazily and reused across the executor, reconciler and verb routing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use tessera_protocol::{ClientError, TesseraClient};

/// Cache of QUIC clients by `host:port` endpoint.
#[derive(Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<String, Arc<TesseraClient>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the client for an endpoint.
    pub async fn get(&self, endpoint: &str) -> Result<Arc<TesseraClient>, ClientError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }
        let addr = endpoint.parse().map_err(|_| {
            ClientError::Service(format!("malformed endpoint {endpoint:?}"))
        })?;
        let client = Arc::new(TesseraClient::dev(addr)?);
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    /// Drop the cached client for an endpoint (after repeated failures).
    pub async fn evict(&self, endpoint: &str) {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.remove(endpoint) {
            client.close().await;
        }
    }
}
