// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera CLI
//!
//! Usage:
//!   tessera <command> [options]
//!
//! Commands:
//!   dev [dirs...]       Build, deploy and watch modules, redeploying on change
//!   deploy [dirs...]    Build and deploy modules once
//!   box run [dir]       Start a controller and deploy a directory of modules

use std::process::ExitCode;

mod cmd_box_run;
mod cmd_deploy;
mod cmd_dev;
mod options;

fn print_usage() {
    eprintln!(
        r#"Usage: tessera <command> [options]

COMMANDS:
    dev [dirs...]           Build, deploy and watch modules for changes
    deploy [dirs...]        Build and deploy modules once
    box run [dir]           Start a controller and deploy precompiled modules

DEV OPTIONS:
    --parallelism <n>       Modules to build in parallel (default: CPU count)
    --watch <duration>      Poll period for file watching (default: 500ms)
    --no-serve              Do not start an embedded controller

DEPLOY OPTIONS:
    --replicas <n>          Replica target for each deployment (default: 1)

BOX RUN OPTIONS:
    --dsn <url>             Database DSN (env: TESSERA_CONTROLLER_DSN)
    --bind <addr>           Controller bind address (env: TESSERA_BIND)
    --ingress-bind <addr>   Ingress bind address (env: TESSERA_INGRESS_BIND)
    --runner-base <addr>    Base bind address for runners (env: TESSERA_RUNNER_BIND)
    --controller-timeout <duration>
                            How long to wait for controller startup (default: 30s)
    --recreate              Drop and recreate the database schema
"#
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tessera=info".parse().unwrap())
                .add_directive("tessera_buildengine=info".parse().unwrap())
                .add_directive("tessera_controller=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return ExitCode::FAILURE;
    };

    let result = match command.as_str() {
        "dev" => cmd_dev::run(&args[1..]).await,
        "deploy" => cmd_deploy::run(&args[1..]).await,
        "box" => match args.get(1).map(String::as_str) {
            Some("run") => cmd_box_run::run(&args[2..]).await,
            _ => {
                print_usage();
                return ExitCode::FAILURE;
            }
        },
        "help" | "--help" | "-h" => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
