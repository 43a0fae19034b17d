// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `tessera dev` - build, deploy and watch modules.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use tessera_buildengine::{CommandCompiler, Engine, LogListener};

use crate::cmd_box_run::start_embedded_controller;
use crate::options::{controller_client, parse_duration, take_value, wait_for_controller};

pub async fn run(args: &[String]) -> Result<()> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let mut watch = Duration::from_millis(500);
    let mut no_serve = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--parallelism" | "-j" => {
                parallelism = take_value("--parallelism", args, &mut i)?
                    .parse()
                    .context("--parallelism must be a number")?;
            }
            "--watch" => {
                watch = parse_duration(take_value("--watch", args, &mut i)?)?;
            }
            "--no-serve" => no_serve = true,
            dir => dirs.push(PathBuf::from(dir)),
        }
        i += 1;
    }
    if dirs.is_empty() {
        dirs.push(PathBuf::from("."));
    }

    if !no_serve {
        start_embedded_controller(false).await?;
    }

    let client = controller_client()?;
    wait_for_controller(&client, Duration::from_secs(30)).await?;

    info!(dirs = ?dirs, parallelism, watch_ms = watch.as_millis() as u64, "starting dev loop");
    let engine = Engine::new(Some(client), dirs, Arc::new(CommandCompiler))
        .await?
        .with_parallelism(parallelism)
        .with_listener(Arc::new(LogListener));

    engine.dev(watch).await?;
    Ok(())
}
