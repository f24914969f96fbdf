// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use zapai_bot::{Bot, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // reqwest and tokio-tungstenite both link rustls; pick the ring backend
    // once, up front, so neither races to install a default provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = Config::from_env().context("loading configuration from environment")?;
    if let Some(relays) = &cli.relays {
        config.relays = relays
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(port) = cli.web_port {
        config.web_port = port;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }

    let running = Bot::from_config(config)?.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("received ctrl-c");
    running.shutdown().await;
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
