// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The schema distribution bus, server side.
//!
//! Deployment row changes raise `deployments_events` notifications (emitted
//! by a database trigger, payload `{table, action, new|old: key}`). This
//! task listens on that channel, loads the affected deployment and fans a
//! typed change event out to every open `PullSchema` stream.
//!
//! Each subscriber gets a bounded channel (128 deep) and the publisher
//! awaits every send, so a slow stream delays publication rather than
//! losing events; subscribers observe changes in notification order.
//! Closed subscribers are pruned on the next publish.

use std::sync::Arc;

use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, error, info, warn};

use tessera_schema::Module;

use crate::dal::Dal;
use crate::keys::DeploymentKey;

const SUBSCRIBER_BUFFER: usize = 128;

/// A schema change fanned out to subscribers.
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub deployment_key: String,
    pub module_name: String,
    /// `None` for removals.
    pub schema: Option<Module>,
    pub change: ChangeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Changed,
    Removed,
}

/// Fan-out hub for schema changes.
pub struct SchemaBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<SchemaChange>>>>,
    shutdown: Arc<Notify>,
}

#[derive(serde::Deserialize)]
struct NotificationPayload {
    action: String,
    #[serde(default)]
    new: Option<String>,
    #[serde(default)]
    old: Option<String>,
}

impl SchemaBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Subscribe with a buffered receiver. Dropping the receiver
    /// unsubscribes on the next publish.
    pub async fn subscribe(&self) -> mpsc::Receiver<SchemaChange> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Publish to all subscribers, awaiting each.
    async fn publish(&self, change: SchemaChange) {
        let mut subscribers = self.subscribers.lock().await;
        let mut open = Vec::with_capacity(subscribers.len());
        for tx in subscribers.drain(..) {
            if tx.send(change.clone()).await.is_ok() {
                open.push(tx);
            }
        }
        *subscribers = open;
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Listen for deployment notifications and publish schema changes.
    pub async fn run(self: Arc<Self>, dal: Dal) {
        loop {
            match self.listen_once(&dal).await {
                Ok(()) => return,
                Err(e) => {
                    error!(error = %e, "schema bus listener failed, restarting");
                    tokio::select! {
                        _ = self.shutdown.notified() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    async fn listen_once(&self, dal: &Dal) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(dal.pool()).await?;
        listener.listen("deployments_events").await?;
        info!("schema bus listening for deployment changes");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("schema bus shutting down");
                    return Ok(());
                }
                notification = listener.recv() => {
                    let notification = notification?;
                    let payload: NotificationPayload =
                        match serde_json::from_str(notification.payload()) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, payload = notification.payload(), "malformed notification");
                                continue;
                            }
                        };
                    if let Some(change) = self.resolve(dal, payload).await {
                        debug!(deployment = %change.deployment_key, change = ?change.change, "schema change");
                        self.publish(change).await;
                    }
                }
            }
        }
    }

    async fn resolve(&self, dal: &Dal, payload: NotificationPayload) -> Option<SchemaChange> {
        match payload.action.as_str() {
            "INSERT" | "UPDATE" => {
                let key = payload.new?;
                let deployment = match dal.get_deployment(&key).await {
                    Ok(deployment) => deployment,
                    Err(e) => {
                        warn!(deployment = %key, error = %e, "notified deployment not loadable");
                        return None;
                    }
                };
                if payload.action == "INSERT" {
                    Some(SchemaChange {
                        deployment_key: key,
                        module_name: deployment.module_name,
                        schema: Some(deployment.schema),
                        change: ChangeType::Added,
                    })
                } else if deployment.min_replicas > 0 {
                    Some(SchemaChange {
                        deployment_key: key,
                        module_name: deployment.module_name,
                        schema: Some(deployment.schema),
                        change: ChangeType::Changed,
                    })
                } else {
                    Some(SchemaChange {
                        deployment_key: key,
                        module_name: deployment.module_name,
                        schema: None,
                        change: ChangeType::Removed,
                    })
                }
            }
            "DELETE" => {
                let key = payload.old?;
                let module_name = key
                    .parse::<DeploymentKey>()
                    .map(|k| k.module)
                    .unwrap_or_else(|_| key.clone());
                Some(SchemaChange {
                    deployment_key: key,
                    module_name,
                    schema: None,
                    change: ChangeType::Removed,
                })
            }
            other => {
                warn!(action = other, "unknown notification action");
                None
            }
        }
    }
}

impl Default for SchemaBus {
    fn default() -> Self {
        Self::new()
    }
}
