// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Formula curve profiles stored as JSON.
//!
//! ```json
//! {
//!   "activation_temp": 50.0,
//!   "max_temp": 95.0,
//!   "min_rpm": 2317.0,
//!   "max_rpm": 6898.0,
//!   "equation": "min_rpm + (max_rpm - min_rpm) * (current_temp - activation_temp) / (max_temp - activation_temp)"
//! }
//! ```

use crate::curve::FormulaCurve;
use crate::error::{FanError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveProfile {
    pub activation_temp: f64,
    pub max_temp: f64,
    pub min_rpm: f64,
    pub max_rpm: f64,
    pub equation: String,
}

impl CurveProfile {
    /// Validate the profile and compile its equation.
    pub fn to_curve(&self) -> Result<FormulaCurve> {
        FormulaCurve::new(
            self.activation_temp,
            self.max_temp,
            self.min_rpm,
            self.max_rpm,
            &self.equation,
        )
    }
}

/// Load a profile from disk. A missing or unparseable file is a
/// configuration error.
pub fn load_profile(path: &Path) -> Result<CurveProfile> {
    if !path.exists() {
        return Err(FanError::config(format!(
            "profile file {} not found",
            path.display()
        )));
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| FanError::config(format!("failed to read {}: {e}", path.display())))?;
    let profile: CurveProfile = serde_json::from_str(&contents)
        .map_err(|e| FanError::config(format!("failed to parse {}: {e}", path.display())))?;

    log::info!("Loaded curve profile from {}", path.display());
    Ok(profile)
}

/// Load and compile a profile in one step.
pub fn load_curve(path: &Path) -> Result<FormulaCurve> {
    load_profile(path)?
        .to_curve()
        .map_err(|e| FanError::config(format!("{}: {e}", path.display())))
}

/// Display name of a profile file: `gaming.curve.json` -> `gaming`.
pub fn profile_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .filter(|n| !n.is_empty())
        .unwrap_or("profile")
        .to_string()
}
