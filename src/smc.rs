// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Probe and actuator backed by the `smc` command-line tool.
//!
//! - `smc list` prints every sensor key with its value, e.g. `[Tp05]  61.25`.
//! - `smc fans` prints one block per fan with `Mode:`, `Target speed:`,
//!   `Actual speed:`, `Minimal speed:` and `Maximum speed:` lines.
//! - `smc fan <id> -m <0|1>` switches a fan between auto and forced.
//! - `smc fan <id> -v <rpm>` sets a forced fan's speed.

use crate::calibration::FanMode;
use crate::device::{Actuator, FanReading, FanReport, Probe, SensorReport, normalize_speed};
use crate::error::{FanError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;

/// Default location of the tool, relative to the working directory.
pub const DEFAULT_SMC_PATH: &str = "data/smc";

static CPU_TEMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(Tp05|Tp0L|Tp0P|Tp0S|Tf04|Tf09|Tf0A|Tf0B|Tf0D|Tf0E|Tf44|Tf49|Tf4A|Tf4B|Tf4D|Tf4E)\s+(-?\d+\.\d+)",
    )
    .expect("CPU sensor pattern is valid")
});

static GPU_TEMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(Tg0f|Tg0j)\s+(-?\d+\.\d+)").expect("GPU sensor pattern is valid"));

static MODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Mode:\s+(\w+)").expect("mode pattern is valid"));

fn speed_re(label: &str) -> Regex {
    Regex::new(&format!(r"{label} speed:\s*(-?\d+(?:\.\d+)?)")).expect("speed pattern is valid")
}

static TARGET_RE: LazyLock<Regex> = LazyLock::new(|| speed_re("Target"));
static ACTUAL_RE: LazyLock<Regex> = LazyLock::new(|| speed_re("Actual"));
static MIN_RE: LazyLock<Regex> = LazyLock::new(|| speed_re("Minimal"));
static MAX_RE: LazyLock<Regex> = LazyLock::new(|| speed_re("Maximum"));

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn capture_values(re: &Regex, text: &str, group: usize) -> Vec<f64> {
    re.captures_iter(text)
        .filter_map(|c| c.get(group).and_then(|m| m.as_str().parse::<f64>().ok()))
        .collect()
}

/// Parse the output of `smc list`.
pub fn parse_sensor_report(text: &str) -> Result<SensorReport> {
    let cleaned = text.replace(['[', ']'], "");
    let report = SensorReport {
        cpu_temps: capture_values(&CPU_TEMP_RE, &cleaned, 2),
        gpu_temps: capture_values(&GPU_TEMP_RE, &cleaned, 2),
    };
    if report.cpu_temps.is_empty() {
        return Err(FanError::probe("no CPU temperature sensors in controller output"));
    }
    if report.gpu_temps.is_empty() {
        log::debug!("No GPU temperature sensors in controller output");
    }
    Ok(report)
}

/// Parse the output of `smc fans`. Fans appear in id order.
pub fn parse_fan_report(text: &str) -> Result<FanReport> {
    let modes: Vec<FanMode> = MODE_RE
        .captures_iter(text)
        .map(|c| {
            if c[1].to_ascii_lowercase().starts_with("auto") {
                FanMode::Auto
            } else {
                FanMode::Forced
            }
        })
        .collect();
    let targets = capture_values(&TARGET_RE, text, 1);
    let actuals = capture_values(&ACTUAL_RE, text, 1);
    let mins = capture_values(&MIN_RE, text, 1);
    let maxs = capture_values(&MAX_RE, text, 1);

    let count = modes.len();
    if count == 0 {
        return Err(FanError::probe("no fans in fan report"));
    }
    if targets.len() != count || actuals.len() != count {
        return Err(FanError::probe(format!(
            "fan report is inconsistent: {count} mode(s), {} target(s), {} actual speed(s)",
            targets.len(),
            actuals.len()
        )));
    }
    // Bounds are only trusted when every fan reports them.
    let bound = |values: &[f64], i: usize| {
        if values.len() == count { Some(values[i]) } else { None }
    };

    let fans = (0..count)
        .map(|i| FanReading {
            mode: modes[i],
            target_speed: normalize_speed(targets[i]),
            actual_speed: normalize_speed(actuals[i]),
            min_speed: bound(mins.as_slice(), i),
            max_speed: bound(maxs.as_slice(), i),
        })
        .collect();

    Ok(FanReport { fans })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to the `smc` tool. Cheap to clone; every call spawns the tool.
#[derive(Debug, Clone)]
pub struct Smc {
    binary: PathBuf,
    timeout: Duration,
}

impl Smc {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the tool and return its stdout. Errors are plain reasons.
    async fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);

        let output = match time::timeout(self.timeout, cmd.output()).await {
            Err(_) => return Err(format!("timed out after {:?}", self.timeout)),
            Ok(Err(e)) => return Err(format!("failed to run {}: {e}", self.binary.display())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} ({})", output.status, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn query(&self, subcommand: &str) -> Result<String> {
        self.run(&[subcommand.to_string()])
            .await
            .map_err(|reason| FanError::probe(format!("smc {subcommand}: {reason}")))
    }

    async fn command(&self, fan_id: u32, flag: &str, value: String, what: String) -> Result<()> {
        let args = ["fan".to_string(), fan_id.to_string(), flag.to_string(), value];
        self.run(&args).await.map(|_| ()).map_err(|reason| FanError::Actuation {
            fan_id,
            command: what,
            reason,
        })
    }
}

impl Probe for Smc {
    async fn query_all(&mut self) -> Result<SensorReport> {
        parse_sensor_report(&self.query("list").await?)
    }

    async fn query_fans(&mut self) -> Result<FanReport> {
        parse_fan_report(&self.query("fans").await?)
    }
}

impl Actuator for Smc {
    async fn set_mode(&mut self, fan_id: u32, mode: FanMode) -> Result<()> {
        log::debug!("Fan {fan_id}: set mode {mode}");
        self.command(fan_id, "-m", mode.code().to_string(), format!("set mode {mode}"))
            .await
    }

    async fn set_speed(&mut self, fan_id: u32, rpm: u32) -> Result<()> {
        log::debug!("Fan {fan_id}: set speed {rpm}");
        self.command(fan_id, "-v", rpm.to_string(), format!("set speed {rpm}"))
            .await
    }
}
