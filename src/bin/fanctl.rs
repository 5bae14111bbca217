// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanctl: inspect the SMC and preview curve profiles without touching fans.

use clap::{Parser, Subcommand};
use smc_fanctl::config;
use smc_fanctl::device::{Probe, TemperatureSource};
use smc_fanctl::profile;
use smc_fanctl::smc::Smc;
use std::path::PathBuf;

/// Upper bound on the rows `simulate` prints.
const MAX_ROWS: usize = 10_000;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanctl", about = "SMC fan curve diagnostics")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print temperatures and per-fan status.
    Status,

    /// Evaluate curve profiles over a temperature range.
    Simulate {
        /// Profile files (e.g. default.curve.json).
        #[arg(required = true)]
        profiles: Vec<PathBuf>,

        /// First temperature, in Celsius.
        #[arg(long, default_value_t = 30.0)]
        from: f64,

        /// Last temperature, in Celsius.
        #[arg(long, default_value_t = 100.0)]
        to: f64,

        /// Step between rows, in Celsius.
        #[arg(long, default_value_t = 5.0)]
        step: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Status => {
            let cfg = config::load_config(&config::resolve_config_path(Some(&cli.config)))?;
            let smc = Smc::new(cfg.daemon.smc_path.clone(), cfg.daemon.query_timeout());
            status(smc).await
        }
        Command::Simulate {
            profiles,
            from,
            to,
            step,
        } => simulate(&profiles, from, to, step),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn status(mut smc: Smc) -> anyhow::Result<()> {
    let sensors = smc.query_all().await?;
    let fans = smc.query_fans().await?;

    let fmt = |t: Option<f64>| t.map_or_else(|| "n/a".to_string(), |t| format!("{t:.1} C"));
    println!("Highest CPU temp:  {}", fmt(sensors.highest_cpu()));
    println!("Average CPU temp:  {}", fmt(sensors.average_cpu()));
    println!("Average GPU temp:  {}", fmt(sensors.average_gpu()));
    println!(
        "Max(CPU, GPU):     {}",
        fmt(sensors.governing(TemperatureSource::MaxCpuGpu).ok())
    );
    println!();

    for (id, fan) in fans.fans.iter().enumerate() {
        let bounds = match (fan.min_speed, fan.max_speed) {
            (Some(min), Some(max)) => format!("{min:.0} - {max:.0} RPM"),
            _ => "unknown".to_string(),
        };
        println!(
            "Fan {id}: mode {:<6}  target {:>5.0} RPM  actual {:>5.0} RPM  bounds {bounds}",
            fan.mode.to_string(),
            fan.target_speed,
            fan.actual_speed
        );
    }
    Ok(())
}

/// Temperatures sampled by `simulate`, from `from` to `to` inclusive.
fn temperatures(from: f64, to: f64, step: f64) -> anyhow::Result<Vec<f64>> {
    anyhow::ensure!(
        from.is_finite() && to.is_finite() && step.is_finite(),
        "temperatures and step must be finite"
    );
    anyhow::ensure!(step > 0.0, "step must be positive");
    anyhow::ensure!(from <= to, "--from must not exceed --to");

    let rows = ((to - from) / step).floor();
    anyhow::ensure!(
        rows < MAX_ROWS as f64,
        "range {from}..{to} in steps of {step} exceeds {MAX_ROWS} rows"
    );
    Ok((0..=rows as usize).map(|i| from + step * i as f64).collect())
}

fn simulate(paths: &[PathBuf], from: f64, to: f64, step: f64) -> anyhow::Result<()> {
    let temps = temperatures(from, to, step)?;

    let mut curves = Vec::with_capacity(paths.len());
    for path in paths {
        curves.push((profile::profile_name(path), profile::load_curve(path)?));
    }

    print!("{:>8}", "temp");
    for (name, _) in &curves {
        print!("  {name:>10}");
    }
    println!();

    for temp in temps {
        print!("{temp:>8.1}");
        for (_, curve) in &curves {
            let (rpm, error) = curve.rpm_or_floor(temp);
            let mark = if error.is_some() { "*" } else { " " };
            print!("  {rpm:>9.0}{mark}");
        }
        println!();
    }
    Ok(())
}
