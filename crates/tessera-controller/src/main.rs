// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Controller daemon.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use tessera_controller::config::Config;
use tessera_controller::daemon;
use tessera_controller::dal::Dal;
use tessera_controller::migrations;
use tessera_controller::scaling::NoScaling;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tessera_controller=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("configuration error: {e}");
        e
    })?;

    info!(
        key = %config.key,
        bind = %config.bind,
        ingress_bind = %config.ingress_bind,
        "starting tessera controller"
    );

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;

    info!("running database migrations");
    migrations::run_postgres(&pool).await?;

    let dal = Dal::new(pool);
    tokio::select! {
        result = daemon::start(config, dal, Arc::new(NoScaling)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
