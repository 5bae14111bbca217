// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Per-fan calibration and the values that flow through one control tick.

use crate::device::FanReading;
use crate::error::{FanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Fan mode
// ---------------------------------------------------------------------------

/// Controller mode of a single fan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    /// Firmware decides the speed.
    Auto,
    /// Commanded speed is honored.
    Forced,
}

impl FanMode {
    /// Numeric code understood by the SMC tool (0 = auto, 1 = forced).
    pub fn code(self) -> u8 {
        match self {
            FanMode::Auto => 0,
            FanMode::Forced => 1,
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanMode::Auto => f.write_str("auto"),
            FanMode::Forced => f.write_str("forced"),
        }
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Calibrated speed range of one physical fan. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanCalibration {
    /// Index into the probe's and actuator's fan order.
    pub fan_id: u32,
    pub min_rpm: f64,
    pub max_rpm: f64,
}

impl FanCalibration {
    pub fn new(fan_id: u32, min_rpm: f64, max_rpm: f64) -> Result<Self> {
        if !min_rpm.is_finite() || !max_rpm.is_finite() {
            return Err(FanError::config(format!(
                "fan {fan_id}: speed bounds must be finite"
            )));
        }
        if min_rpm >= max_rpm {
            return Err(FanError::config(format!(
                "fan {fan_id}: min_rpm ({min_rpm}) must be below max_rpm ({max_rpm})"
            )));
        }
        Ok(Self {
            fan_id,
            min_rpm,
            max_rpm,
        })
    }

    /// Derive the calibration from the bounds the probe reports for a fan.
    pub fn from_reading(fan_id: u32, reading: &FanReading) -> Result<Self> {
        match (reading.min_speed, reading.max_speed) {
            (Some(min), Some(max)) => Self::new(fan_id, min, max),
            _ => Err(FanError::config(format!(
                "fan {fan_id}: probe reported no speed boundaries"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tick values
// ---------------------------------------------------------------------------

/// Speed commanded to one fan during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanTarget {
    pub fan_id: u32,
    pub rpm: u32,
}

/// Everything computed during one loop iteration. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlTick {
    /// Governing temperature in degrees Celsius.
    pub temperature: f64,
    /// Demand of each curve, in curve order.
    pub fractions: Vec<f64>,
    /// Arbitrated demand.
    pub fraction: f64,
    pub targets: Vec<FanTarget>,
}

impl ControlTick {
    /// False when no curve asked for any cooling this tick.
    pub fn has_demand(&self) -> bool {
        self.fraction > 0.0
    }

    pub fn target_for(&self, fan_id: u32) -> Option<u32> {
        self.targets
            .iter()
            .find(|t| t.fan_id == fan_id)
            .map(|t| t.rpm)
    }
}
