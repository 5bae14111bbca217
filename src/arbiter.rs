// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Combines curve demands into one target and maps it onto each fan.

use crate::calibration::{FanCalibration, FanTarget};
use crate::error::{FanError, Result};

/// Safety-first arbitration over all curves, plus per-fan RPM mapping.
#[derive(Debug, Clone)]
pub struct SpeedArbiter {
    fans: Vec<FanCalibration>,
}

impl SpeedArbiter {
    pub fn new(fans: Vec<FanCalibration>) -> Result<Self> {
        if fans.is_empty() {
            return Err(FanError::config("no fans configured"));
        }
        for (i, fan) in fans.iter().enumerate() {
            if fans[..i].iter().any(|f| f.fan_id == fan.fan_id) {
                return Err(FanError::config(format!(
                    "fan {} is configured more than once",
                    fan.fan_id
                )));
            }
        }
        Ok(Self { fans })
    }

    pub fn fans(&self) -> &[FanCalibration] {
        &self.fans
    }

    pub fn fan_ids(&self) -> Vec<u32> {
        self.fans.iter().map(|f| f.fan_id).collect()
    }

    /// The most demanding curve wins.
    pub fn arbitrate(&self, fractions: &[f64]) -> Result<f64> {
        arbitrate(fractions)
    }

    /// Target RPM for every calibrated fan at `fraction`.
    pub fn targets(&self, fraction: f64) -> Vec<FanTarget> {
        self.fans
            .iter()
            .map(|cal| FanTarget {
                fan_id: cal.fan_id,
                rpm: to_rpm(fraction, cal),
            })
            .collect()
    }
}

/// Maximum of all curve demands, clamped to `[0, 1]`.
pub fn arbitrate(fractions: &[f64]) -> Result<f64> {
    if fractions.is_empty() {
        return Err(FanError::config("no governing curve to arbitrate"));
    }
    let max = fractions
        .iter()
        .copied()
        .filter(|f| !f.is_nan())
        .fold(0.0_f64, f64::max);
    Ok(max.clamp(0.0, 1.0))
}

/// Map a demand fraction onto a fan's calibrated range.
///
/// Zero is only commanded for a non-positive fraction. A positive fraction
/// never rounds down to 0.
pub fn to_rpm(fraction: f64, cal: &FanCalibration) -> u32 {
    let raw = cal.min_rpm + (cal.max_rpm - cal.min_rpm) * fraction;
    let rpm = if raw > cal.max_rpm {
        cal.max_rpm
    } else if raw > 0.0 && fraction > 0.0 {
        raw.round().max(1.0)
    } else {
        0.0
    };
    rpm.round() as u32
}
