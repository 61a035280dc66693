// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use serde::Deserialize;
use tracing::error;

use regmux::config::{RuntimeArgs, Topology};
use regmux::{process_chain, Command, Runtime};

/// One scripted step: a chain of commands issued by a fresh client of the
/// named device.
#[derive(Debug, Deserialize)]
struct ScriptStep {
    device: String,
    commands: Vec<Command>,
}

#[tokio::main]
async fn main() {
    let args = RuntimeArgs::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = run(args).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: RuntimeArgs) -> anyhow::Result<()> {
    let topology = Topology::load(&args.topology)?;
    let runtime = Runtime::from_topology(&topology)
        .map_err(|code| anyhow::anyhow!("invalid topology: {code}"))?;

    match args.script {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)?;
            let steps: Vec<ScriptStep> = serde_json::from_str(&contents)?;
            for step in steps {
                let device = runtime
                    .device_by_name(&step.device)
                    .map_err(|code| anyhow::anyhow!("unknown device {}: {code}", step.device))?;
                let client = runtime
                    .connect(device.id)
                    .map_err(|code| anyhow::anyhow!("connect failed: {code}"))?;
                let results = process_chain(&runtime, &client, step.commands).await;
                println!("{}", serde_json::to_string_pretty(&results)?);
                runtime.disconnect(&client).await;
            }
        }
        None => {
            tracing::info!(devices = runtime.devices().len(), "topology up, waiting for ctrl-c");
            tokio::signal::ctrl_c().await?;
        }
    }
    runtime.shutdown().await;
    Ok(())
}
