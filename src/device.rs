// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Contracts for the hardware collaborators.
//!
//! A [`Probe`] reports temperatures and fan status; an [`Actuator`] accepts
//! mode and speed commands. The control loop depends only on these traits.

#![allow(async_fn_in_trait)]

use crate::calibration::FanMode;
use crate::error::{FanError, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// How the governing temperature is derived from a sensor report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureSource {
    /// Hottest CPU sensor.
    #[default]
    HighestCpu,
    /// Hottest CPU sensor or the GPU average, whichever is higher.
    MaxCpuGpu,
}

/// Temperatures from one full controller query, in degrees Celsius.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReport {
    pub cpu_temps: Vec<f64>,
    pub gpu_temps: Vec<f64>,
}

impl SensorReport {
    pub fn highest_cpu(&self) -> Option<f64> {
        self.cpu_temps.iter().copied().reduce(f64::max)
    }

    pub fn average_cpu(&self) -> Option<f64> {
        average(&self.cpu_temps)
    }

    pub fn average_gpu(&self) -> Option<f64> {
        average(&self.gpu_temps)
    }

    /// The single temperature the curves are evaluated against.
    pub fn governing(&self, source: TemperatureSource) -> Result<f64> {
        let cpu = self
            .highest_cpu()
            .ok_or_else(|| FanError::probe("no CPU temperature in sensor report"))?;
        Ok(match (source, self.average_gpu()) {
            (TemperatureSource::MaxCpuGpu, Some(gpu)) => cpu.max(gpu),
            _ => cpu,
        })
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Live status of one fan. Unknown speeds are reported as 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanReading {
    pub mode: FanMode,
    pub target_speed: f64,
    pub actual_speed: f64,
    pub min_speed: Option<f64>,
    pub max_speed: Option<f64>,
}

/// Status of every fan, indexed by fan id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanReport {
    pub fans: Vec<FanReading>,
}

impl FanReport {
    pub fn get(&self, fan_id: u32) -> Option<&FanReading> {
        self.fans.get(fan_id as usize)
    }
}

/// Map the `-1` "not applicable" sentinel to 0.
pub fn normalize_speed(speed: f64) -> f64 {
    if speed == -1.0 { 0.0 } else { speed }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Source of temperature and fan status.
pub trait Probe {
    async fn query_all(&mut self) -> Result<SensorReport>;
    async fn query_fans(&mut self) -> Result<FanReport>;
}

/// Sink for fan commands. Failures are reported, never fatal.
pub trait Actuator {
    async fn set_mode(&mut self, fan_id: u32, mode: FanMode) -> Result<()>;
    async fn set_speed(&mut self, fan_id: u32, rpm: u32) -> Result<()>;
}

/// Cycle a fan auto -> forced so the controller re-arms.
pub async fn cycle_mode<A: Actuator>(actuator: &mut A, fan_id: u32) -> Result<()> {
    actuator.set_mode(fan_id, FanMode::Auto).await?;
    actuator.set_mode(fan_id, FanMode::Forced).await
}

/// Restore every fan to automatic control (safety fallback).
///
/// Each fan is attempted even if an earlier one fails.
pub async fn restore_all_automatic<A: Actuator>(actuator: &mut A, fan_ids: &[u32]) {
    for &fan_id in fan_ids {
        match actuator.set_mode(fan_id, FanMode::Auto).await {
            Ok(()) => log::info!("Fan {fan_id} restored to automatic control"),
            Err(e) => log::error!("Failed to restore automatic control for fan {fan_id}: {e}"),
        }
    }
}
