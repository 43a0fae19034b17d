// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable controller daemon.
//!
//! Assembles the background tasks (schema bus, heartbeat, reapers,
//! reconciler, executor, cron and pub/sub schedulers) and runs the two QUIC
//! services. Blocks until a server fails; embedders (`box run`, tests)
//! spawn it on a task.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::bus::SchemaBus;
use crate::clients::ClientCache;
use crate::config::Config;
use crate::cron::CronScheduler;
use crate::dal::Dal;
use crate::error::DalError;
use crate::executor::AsyncCallExecutor;
use crate::pubsub::PubsubScheduler;
use crate::reconciler::Reconciler;
use crate::scaling::RunnerScaling;
use crate::server::{ControllerService, VerbService, run_controller_server, run_verb_server};

/// Run the controller against an initialized database.
///
/// Migrations must already have been applied (see [`crate::migrations`]).
pub async fn start(
    config: Config,
    dal: Dal,
    scaling: Arc<dyn RunnerScaling>,
) -> Result<(), tessera_protocol::ServerError> {
    let clients = Arc::new(ClientCache::new());
    let bus = Arc::new(SchemaBus::new());

    tokio::spawn(bus.clone().run(dal.clone()));

    // Controller liveness heartbeat.
    {
        let dal = dal.clone();
        let key = config.key.clone();
        let advertise = config.advertise.clone();
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                if let Err(e) = dal.upsert_controller(&key, &advertise).await {
                    error!(error = %e, "controller heartbeat failed");
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    // Reapers: leases, runner reservations, stale liveness.
    spawn_reaper("lease expiry", Duration::from_secs(1), {
        let dal = dal.clone();
        move || {
            let dal = dal.clone();
            async move { dal.expire_leases().await.map(|_| ()) }
        }
    });
    spawn_reaper("reservation expiry", Duration::from_secs(1), {
        let dal = dal.clone();
        move || {
            let dal = dal.clone();
            async move {
                for runner in dal.expire_runner_reservations().await? {
                    info!(runner = %runner.key, "reservation expired, runner back to idle");
                }
                Ok(())
            }
        }
    });
    spawn_reaper("stale liveness", config.heartbeat_interval, {
        let dal = dal.clone();
        let timeout = config.stale_timeout.as_millis() as i64;
        move || {
            let dal = dal.clone();
            async move {
                dal.kill_stale_runners(timeout).await?;
                dal.kill_stale_controllers(timeout).await?;
                Ok(())
            }
        }
    });

    let reconciler = Reconciler::new(
        dal.clone(),
        clients.clone(),
        scaling,
        config.reconcile_interval,
    );
    tokio::spawn(reconciler.run());

    let executor = AsyncCallExecutor::new(
        dal.clone(),
        clients.clone(),
        config.executor_poll_interval,
        config.async_call_lease,
    );
    tokio::spawn(executor.run());

    let cron = CronScheduler::new(dal.clone(), Duration::from_secs(1));
    tokio::spawn(cron.run());

    let pubsub = PubsubScheduler::new(dal.clone(), Duration::from_secs(1));
    tokio::spawn(pubsub.run());

    let controller_state = Arc::new(ControllerService::new(dal.clone(), bus.clone()));
    let verb_state = Arc::new(VerbService::new(dal.clone(), clients.clone()));

    info!(key = %config.key, bind = %config.bind, ingress_bind = %config.ingress_bind, "controller started");
    tokio::try_join!(
        run_controller_server(config.bind, controller_state),
        run_verb_server(config.ingress_bind, verb_state),
    )?;
    Ok(())
}

fn spawn_reaper<F, Fut>(name: &'static str, interval: Duration, mut tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), DalError>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = tick().await {
                error!(reaper = name, error = %e, "reaper tick failed");
            }
        }
    });
}
