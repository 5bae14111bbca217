// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanctl-daemon: runs the fan curves against the SMC until stopped, then
//! hands every fan back to automatic control.

use anyhow::Context;
use clap::Parser;
use smc_fanctl::config;
use smc_fanctl::reconcile::{self, ReconciliationLoop};
use smc_fanctl::smc::Smc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanctl-daemon", about = "SMC fan curve daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Take control of the fans and run the curves.
    #[arg(long, conflicts_with = "off")]
    on: bool,

    /// Return every fan to automatic control and exit.
    #[arg(long)]
    off: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));

    if !nix::unistd::Uid::effective().is_root() {
        log::warn!("Not running as root; fan commands will likely be rejected");
    }

    if cli.off || !cli.on {
        // A broken config must not stop the fans from being released.
        let cfg = config::load_config_or_default(&config_path);
        let mut smc = Smc::new(cfg.daemon.smc_path.clone(), cfg.daemon.query_timeout());
        reconcile::release(&mut smc, &cfg).await;
        return Ok(());
    }

    let cfg = config::load_config(&config_path)?;
    let mut smc = Smc::new(cfg.daemon.smc_path.clone(), cfg.daemon.query_timeout());
    log::debug!("Using SMC tool at {}", smc.binary().display());

    let mut control = ReconciliationLoop::start(
        &cfg,
        &config::config_dir(&config_path),
        smc.clone(),
        smc.clone(),
    )
    .await
    .context("failed to start fan controller")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Signal handler
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        log::info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    log::info!("Commencing custom fan control");
    let task = tokio::spawn(async move { control.run(shutdown_rx).await });
    reconcile::supervise(task, &mut smc, &cfg.fan_ids())
        .await
        .context("fan controller failed")
}
