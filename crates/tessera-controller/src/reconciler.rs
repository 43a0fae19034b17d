// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The deployment reconciler.
//!
//! Periodically compares each deployment's assigned-runner count against its
//! replica target. Shortfalls reserve idle runners (asking the scaler to
//! grow when none match); surpluses drain runners via Terminate. Failures
//! are logged and retried on the next scan, never aborting the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tessera_protocol::RunnerClient;

use crate::clients::ClientCache;
use crate::dal::{Dal, Reconciliation};
use crate::error::DalResult;
use crate::scaling::RunnerScaling;

/// Default reservation window granted when reserving a runner.
pub const RESERVATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Background task converging assigned runners to replica targets.
pub struct Reconciler {
    dal: Dal,
    clients: Arc<ClientCache>,
    scaling: Arc<dyn RunnerScaling>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    pub fn new(
        dal: Dal,
        clients: Arc<ClientCache>,
        scaling: Arc<dyn RunnerScaling>,
        interval: Duration,
    ) -> Self {
        Self {
            dal,
            clients,
            scaling,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "reconciler started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reconciler shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "reconciliation scan failed");
                    }
                }
            }
        }
    }

    /// One scan over all deployments needing attention.
    pub async fn reconcile_all(&self) -> DalResult<()> {
        for deployment in self.dal.get_deployments_needing_reconciliation().await? {
            if let Err(e) = self.reconcile(&deployment).await {
                // Failure of one deployment must not starve the rest.
                error!(deployment = %deployment.key, error = %e, "reconciliation failed");
            }
        }
        Ok(())
    }

    async fn reconcile(&self, deployment: &Reconciliation) -> DalResult<()> {
        let assigned = deployment.assigned_replicas as i32;
        let required = deployment.min_replicas;
        debug!(
            deployment = %deployment.key,
            assigned,
            required,
            "reconciling deployment"
        );

        if assigned < required {
            self.grow(deployment, required - assigned).await
        } else {
            self.shrink(deployment, assigned - required).await
        }
    }

    async fn grow(&self, deployment: &Reconciliation, shortfall: i32) -> DalResult<()> {
        for _ in 0..shortfall {
            let runner = match self
                .dal
                .reserve_runner(
                    &deployment.labels,
                    &deployment.key,
                    Utc::now() + chrono::Duration::from_std(RESERVATION_TIMEOUT).unwrap_or_default(),
                )
                .await
            {
                Ok(runner) => runner,
                Err(e) if e.is_not_found() => {
                    if let Err(e) = self
                        .scaling
                        .grow(&deployment.key, &deployment.labels, shortfall)
                        .await
                    {
                        warn!(error = %e, "scaler rejected growth request");
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            // Tell the runner to pull the deployment. If this fails the
            // reservation simply times out back to idle.
            match self.clients.get(&runner.endpoint).await {
                Ok(client) => {
                    if let Err(e) = RunnerClient::new(client)
                        .deploy(deployment.key.clone())
                        .await
                    {
                        warn!(
                            runner = %runner.key,
                            deployment = %deployment.key,
                            error = %e,
                            "deploy RPC failed; reservation will expire"
                        );
                        self.clients.evict(&runner.endpoint).await;
                    } else {
                        info!(runner = %runner.key, deployment = %deployment.key, "deployment dispatched");
                    }
                }
                Err(e) => {
                    warn!(runner = %runner.key, error = %e, "runner endpoint unusable");
                }
            }
        }
        Ok(())
    }

    async fn shrink(&self, deployment: &Reconciliation, surplus: i32) -> DalResult<()> {
        let runners = self.dal.get_runners_for_deployment(&deployment.key).await?;
        for runner in runners.iter().take(surplus as usize) {
            match self.clients.get(&runner.endpoint).await {
                Ok(client) => {
                    if let Err(e) = RunnerClient::new(client)
                        .terminate(deployment.key.clone())
                        .await
                    {
                        warn!(runner = %runner.key, error = %e, "terminate RPC failed");
                        self.clients.evict(&runner.endpoint).await;
                    } else {
                        info!(runner = %runner.key, deployment = %deployment.key, "runner drained");
                    }
                }
                Err(e) => {
                    warn!(runner = %runner.key, error = %e, "runner endpoint unusable");
                }
            }
        }
        Ok(())
    }
}
