// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Describes the fans, the curves and the loop timing in TOML.
//! Default path: `/etc/fanctl/config.toml`

use crate::calibration::FanCalibration;
use crate::curve::{self, AnchorCurve, Curve, CurveSpec, FormulaCurve};
use crate::device::{FanReport, TemperatureSource};
use crate::error::{FanError, Result};
use crate::profile;
use crate::smc::DEFAULT_SMC_PATH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fanctl/config.toml";

/// Default tick interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 2000;

/// Default tolerance, in RPM, for a fan to count as converged.
pub const DEFAULT_RPM_TOLERANCE: u32 = 10;

/// Default upper bound on a single `smc` invocation, in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Physical fans, in any order.
    #[serde(default = "default_fans")]
    pub fans: Vec<FanConfig>,

    /// Every curve competes; the most demanding one wins.
    #[serde(default = "default_curves")]
    pub curves: Vec<CurveConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_rpm_tolerance")]
    pub rpm_tolerance: u32,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Path of the `smc` tool.
    #[serde(default = "default_smc_path")]
    pub smc_path: PathBuf,

    #[serde(default)]
    pub temperature_source: TemperatureSource,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            rpm_tolerance: DEFAULT_RPM_TOLERANCE,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            smc_path: PathBuf::from(DEFAULT_SMC_PATH),
            temperature_source: TemperatureSource::default(),
        }
    }
}

impl DaemonConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// One physical fan. Missing bounds are read from the probe at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanConfig {
    pub id: u32,
    #[serde(default)]
    pub min_rpm: Option<f64>,
    #[serde(default)]
    pub max_rpm: Option<f64>,
}

impl FanConfig {
    pub fn needs_calibration(&self) -> bool {
        self.min_rpm.is_none() || self.max_rpm.is_none()
    }

    /// Build the calibration, querying `report` for missing bounds.
    pub fn calibrate(&self, report: Option<&FanReport>) -> Result<FanCalibration> {
        match (self.min_rpm, self.max_rpm) {
            (Some(min), Some(max)) => FanCalibration::new(self.id, min, max),
            _ => {
                let reading = report.and_then(|r| r.get(self.id)).ok_or_else(|| {
                    FanError::config(format!("fan {} is not present in the fan report", self.id))
                })?;
                let cal = FanCalibration::from_reading(self.id, reading)?;
                log::warn!(
                    "Fan {}: bounds set from controller to {} - {} RPM",
                    self.id,
                    cal.min_rpm,
                    cal.max_rpm
                );
                Ok(cal)
            }
        }
    }
}

/// A curve entry, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CurveConfig {
    Anchor {
        name: String,
        temp_lo: f64,
        temp_hi: f64,
        activation_temp: f64,
        deactivation_temp: f64,
        jurisdiction_lo: f64,
        jurisdiction_hi: f64,
        /// Start the curve activated.
        #[serde(default)]
        activated: bool,
    },
    Formula {
        name: String,
        activation_temp: f64,
        max_temp: f64,
        min_rpm: f64,
        max_rpm: f64,
        equation: String,
    },
    Profile {
        path: PathBuf,
        #[serde(default)]
        name: Option<String>,
        /// Replace the profile's speed range with this fan's calibration.
        #[serde(default)]
        bounds_from_fan: Option<u32>,
    },
}

impl CurveConfig {
    /// Build the runtime curve. Relative profile paths resolve against
    /// `base_dir`.
    pub fn build(&self, base_dir: &Path, fans: &[FanCalibration]) -> Result<Curve> {
        match self {
            CurveConfig::Anchor {
                name,
                temp_lo,
                temp_hi,
                activation_temp,
                deactivation_temp,
                jurisdiction_lo,
                jurisdiction_hi,
                activated,
            } => {
                let anchor = AnchorCurve::new(
                    (*temp_lo, *temp_hi),
                    (*activation_temp, *deactivation_temp),
                    (*jurisdiction_lo, *jurisdiction_hi),
                )
                .map_err(|e| FanError::config(format!("curve '{name}': {e}")))?;
                Ok(Curve::with_state(name.clone(), CurveSpec::Anchor(anchor), *activated))
            }
            CurveConfig::Formula {
                name,
                activation_temp,
                max_temp,
                min_rpm,
                max_rpm,
                equation,
            } => {
                let formula =
                    FormulaCurve::new(*activation_temp, *max_temp, *min_rpm, *max_rpm, equation)
                        .map_err(|e| FanError::config(format!("curve '{name}': {e}")))?;
                Ok(Curve::new(name.clone(), CurveSpec::Formula(formula)))
            }
            CurveConfig::Profile {
                path,
                name,
                bounds_from_fan,
            } => {
                let resolved = if path.is_relative() {
                    base_dir.join(path)
                } else {
                    path.clone()
                };
                let mut formula = profile::load_curve(&resolved)?;
                if let Some(fan_id) = bounds_from_fan {
                    let cal = fans.iter().find(|f| f.fan_id == *fan_id).ok_or_else(|| {
                        FanError::config(format!(
                            "profile {} takes bounds from unknown fan {fan_id}",
                            resolved.display()
                        ))
                    })?;
                    formula = formula.with_bounds(cal);
                }
                let name = name.clone().unwrap_or_else(|| profile::profile_name(&resolved));
                Ok(Curve::new(name, CurveSpec::Formula(formula)))
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            fans: default_fans(),
            curves: default_curves(),
        }
    }
}

impl Config {
    pub fn needs_calibration(&self) -> bool {
        self.fans.iter().any(FanConfig::needs_calibration)
    }

    /// Calibrate every fan. `report` is only consulted for fans without
    /// static bounds.
    pub fn calibrations(&self, report: Option<&FanReport>) -> Result<Vec<FanCalibration>> {
        self.fans.iter().map(|f| f.calibrate(report)).collect()
    }

    pub fn build_curves(&self, base_dir: &Path, fans: &[FanCalibration]) -> Result<Vec<Curve>> {
        if self.curves.is_empty() {
            return Err(FanError::config("at least one fan curve is required"));
        }
        self.curves.iter().map(|c| c.build(base_dir, fans)).collect()
    }

    pub fn fan_ids(&self) -> Vec<u32> {
        self.fans.iter().map(|f| f.id).collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| FanError::config(format!("failed to read {}: {e}", path.display())))?;
    let config = parse_config(&contents)
        .map_err(|e| FanError::config(format!("{}: {e}", path.display())))?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Like [`load_config`], but falls back to the defaults when the file is
/// unreadable or malformed. Used where the fans must be released regardless.
pub fn load_config_or_default(path: &Path) -> Config {
    load_config(path).unwrap_or_else(|e| {
        log::warn!("{e}; falling back to the default fan list");
        Config::default()
    })
}

pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents)
        .map_err(|e| FanError::config(format!("failed to parse config: {e}")))?;
    if config.daemon.tick_interval_ms == 0 {
        return Err(FanError::config("tick_interval_ms must be positive"));
    }
    if config.fans.is_empty() {
        return Err(FanError::config("no fans configured"));
    }
    Ok(config)
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Directory relative profile paths resolve against.
pub fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_rpm_tolerance() -> u32 {
    DEFAULT_RPM_TOLERANCE
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

fn default_smc_path() -> PathBuf {
    PathBuf::from(DEFAULT_SMC_PATH)
}

fn default_fans() -> Vec<FanConfig> {
    vec![
        FanConfig {
            id: 0,
            min_rpm: Some(2317.0),
            max_rpm: Some(6898.0),
        },
        FanConfig {
            id: 1,
            min_rpm: Some(2502.0),
            max_rpm: Some(7450.0),
        },
    ]
}

fn default_curves() -> Vec<CurveConfig> {
    curve::default_anchor_curves()
        .into_iter()
        .map(|(name, c)| CurveConfig::Anchor {
            name,
            temp_lo: c.temp_lo,
            temp_hi: c.temp_hi,
            activation_temp: c.activation_temp,
            deactivation_temp: c.deactivation_temp,
            jurisdiction_lo: c.jurisdiction_lo,
            jurisdiction_hi: c.jurisdiction_hi,
            activated: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::FanMode;
    use crate::device::FanReading;

    const SAMPLE: &str = r#"
[daemon]
tick_interval_ms = 1500
rpm_tolerance = 25
temperature_source = "max_cpu_gpu"

[[fans]]
id = 0
min_rpm = 2317.0
max_rpm = 6898.0

[[fans]]
id = 1

[[curves]]
kind = "anchor"
name = "baseline"
temp_lo = 70.0
temp_hi = 300.0
activation_temp = 75.0
deactivation_temp = 70.0
jurisdiction_lo = 0.0
jurisdiction_hi = 80.0

[[curves]]
kind = "formula"
name = "linear"
activation_temp = 50.0
max_temp = 90.0
min_rpm = 2000.0
max_rpm = 6000.0
equation = "min_rpm + (max_rpm - min_rpm) * (current_temp - activation_temp) / (max_temp - activation_temp)"
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.daemon.tick_interval(), Duration::from_millis(1500));
        assert_eq!(cfg.daemon.rpm_tolerance, 25);
        assert_eq!(cfg.daemon.query_timeout_ms, DEFAULT_QUERY_TIMEOUT_MS);
        assert_eq!(cfg.daemon.temperature_source, TemperatureSource::MaxCpuGpu);
        assert_eq!(cfg.fan_ids(), vec![0, 1]);
        assert!(cfg.needs_calibration());
        assert_eq!(cfg.curves.len(), 2);

        let curves = cfg.build_curves(Path::new("."), &[]).unwrap();
        assert_eq!(curves[0].name, "baseline");
        assert!(matches!(curves[1].spec, CurveSpec::Formula(_)));
    }

    #[test]
    fn test_calibration_from_report() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert!(cfg.calibrations(None).is_err());

        let reading = FanReading {
            mode: FanMode::Auto,
            target_speed: 0.0,
            actual_speed: 1200.0,
            min_speed: Some(2502.0),
            max_speed: Some(7450.0),
        };
        let report = FanReport {
            fans: vec![reading, reading],
        };
        let cals = cfg.calibrations(Some(&report)).unwrap();
        assert_eq!(cals[0].max_rpm, 6898.0);
        assert_eq!(cals[1].min_rpm, 2502.0);
    }

    #[test]
    fn test_default_config_is_complete() {
        let cfg = Config::default();
        assert!(!cfg.needs_calibration());
        let fans = cfg.calibrations(None).unwrap();
        assert_eq!(fans.len(), 2);
        let curves = cfg.build_curves(Path::new("."), &fans).unwrap();
        assert_eq!(curves.len(), 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[daemon
tick_interval_ms = ").unwrap();

        assert!(load_config(&path).is_err());
        let cfg = load_config_or_default(&path);
        assert_eq!(cfg.fan_ids(), vec![0, 1]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(parse_config("[daemon]\ntick_interval_ms = 0\n").is_err());
        assert!(parse_config("fans = []\n").is_err());
        assert!(parse_config("[[curves]]\nkind = \"spline\"\n").is_err());

        let bad_anchor = r#"
[[curves]]
kind = "anchor"
name = "flat"
temp_lo = 70.0
temp_hi = 70.0
activation_temp = 75.0
deactivation_temp = 70.0
jurisdiction_lo = 0.0
jurisdiction_hi = 80.0
"#;
        let cfg = parse_config(bad_anchor).unwrap();
        assert!(matches!(
            cfg.build_curves(Path::new("."), &[]),
            Err(FanError::Configuration(_))
        ));
    }

    #[test]
    fn test_profile_curve_resolves_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("gaming.curve.json"),
            r#"{"activation_temp": 50.0, "max_temp": 90.0, "min_rpm": 1.0, "max_rpm": 2.0, "equation": "max_rpm"}"#,
        )
        .unwrap();
        let cfg = parse_config(
            "[[curves]]\nkind = \"profile\"\npath = \"gaming.curve.json\"\nbounds_from_fan = 0\n",
        )
        .unwrap();
        let fans = cfg.calibrations(None).unwrap();
        let curves = cfg.build_curves(dir.path(), &fans).unwrap();
        assert_eq!(curves[0].name, "gaming");
        match &curves[0].spec {
            CurveSpec::Formula(f) => assert_eq!(f.max_rpm, 6898.0),
            other => panic!("unexpected spec {other:?}"),
        }

        let missing = parse_config("[[curves]]\nkind = \"profile\"\npath = \"nope.json\"\n").unwrap();
        assert!(matches!(
            missing.build_curves(dir.path(), &fans),
            Err(FanError::Configuration(_))
        ));
    }
}
