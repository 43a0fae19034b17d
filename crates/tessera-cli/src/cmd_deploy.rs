// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `tessera deploy` - build and deploy modules once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use tessera_buildengine::{CommandCompiler, Engine, LogListener};

use crate::options::{controller_client, take_value, wait_for_controller};

pub async fn run(args: &[String]) -> Result<()> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut replicas: i32 = 1;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--replicas" => {
                replicas = take_value("--replicas", args, &mut i)?
                    .parse()
                    .context("--replicas must be a number")?;
            }
            dir => dirs.push(PathBuf::from(dir)),
        }
        i += 1;
    }
    if dirs.is_empty() {
        dirs.push(PathBuf::from("."));
    }

    let client = controller_client()?;
    wait_for_controller(&client, Duration::from_secs(30)).await?;

    let engine = Engine::new(Some(client), dirs, Arc::new(CommandCompiler))
        .await?
        .with_listener(Arc::new(LogListener));
    engine.build_and_deploy(replicas, true, &[]).await?;
    Ok(())
}
