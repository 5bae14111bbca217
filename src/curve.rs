// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions and evaluation.
//!
//! A curve maps the governing temperature to a demand fraction in `[0, 1]`.
//! Two shapes exist:
//!
//! - **Anchor** curves interpolate linearly between two anchor temperatures,
//!   but only while activated (with hysteresis) and inside their
//!   jurisdiction band.
//! - **Formula** curves evaluate a user expression that yields an absolute
//!   RPM, normalized against the curve's own speed range.

use crate::calibration::FanCalibration;
use crate::error::{FanError, Result};
use crate::expr::{Bindings, ExprError, Formula};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Anchor form
// ---------------------------------------------------------------------------

/// Linear curve with asymmetric hysteresis and a validity band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorCurve {
    /// Temperature at which demand is 0.
    pub temp_lo: f64,
    /// Temperature at which demand is 1.
    pub temp_hi: f64,
    /// Deactivated curves turn on at or above this temperature.
    pub activation_temp: f64,
    /// Activated curves turn off below this temperature.
    pub deactivation_temp: f64,
    pub jurisdiction_lo: f64,
    pub jurisdiction_hi: f64,
}

impl AnchorCurve {
    /// Build a curve from `(temp_lo, temp_hi)` anchors,
    /// `(activation, deactivation)` thresholds and a `(lo, hi)` jurisdiction.
    pub fn new(anchors: (f64, f64), hysteresis: (f64, f64), jurisdiction: (f64, f64)) -> Result<Self> {
        let curve = Self {
            temp_lo: anchors.0,
            temp_hi: anchors.1,
            activation_temp: hysteresis.0,
            deactivation_temp: hysteresis.1,
            jurisdiction_lo: jurisdiction.0,
            jurisdiction_hi: jurisdiction.1,
        };
        curve.validate()?;
        Ok(curve)
    }

    pub fn validate(&self) -> Result<()> {
        let all = [
            self.temp_lo,
            self.temp_hi,
            self.activation_temp,
            self.deactivation_temp,
            self.jurisdiction_lo,
            self.jurisdiction_hi,
        ];
        if all.iter().any(|t| !t.is_finite()) {
            return Err(FanError::config("curve temperatures must be finite"));
        }
        if self.temp_hi == self.temp_lo {
            return Err(FanError::config(format!(
                "degenerate anchors: temp_lo and temp_hi are both {}",
                self.temp_lo
            )));
        }
        if self.activation_temp < self.deactivation_temp {
            return Err(FanError::config(format!(
                "activation_temp ({}) must not be below deactivation_temp ({})",
                self.activation_temp, self.deactivation_temp
            )));
        }
        if self.jurisdiction_lo > self.jurisdiction_hi {
            return Err(FanError::config(format!(
                "jurisdiction band is inverted ({}..{})",
                self.jurisdiction_lo, self.jurisdiction_hi
            )));
        }
        Ok(())
    }

    pub fn in_jurisdiction(&self, temp: f64) -> bool {
        self.jurisdiction_lo <= temp && temp <= self.jurisdiction_hi
    }

    /// Raw interpolated demand, ignoring activation and jurisdiction.
    pub fn interpolate(&self, temp: f64) -> f64 {
        ((temp - self.temp_lo) / (self.temp_hi - self.temp_lo)).clamp(0.0, 1.0)
    }

    /// Apply the hysteresis transition for `temp`.
    fn transition(&self, activated: bool, temp: f64) -> bool {
        if activated {
            temp >= self.deactivation_temp
        } else {
            temp >= self.activation_temp
        }
    }
}

// ---------------------------------------------------------------------------
// Formula form
// ---------------------------------------------------------------------------

/// Curve driven by a sandboxed expression that yields an absolute RPM.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaCurve {
    pub activation_temp: f64,
    pub max_temp: f64,
    pub min_rpm: f64,
    pub max_rpm: f64,
    formula: Formula,
}

impl FormulaCurve {
    pub fn new(
        activation_temp: f64,
        max_temp: f64,
        min_rpm: f64,
        max_rpm: f64,
        equation: &str,
    ) -> Result<Self> {
        let formula = Formula::parse(equation)
            .map_err(|e| FanError::config(format!("invalid equation '{equation}': {e}")))?;
        let curve = Self {
            activation_temp,
            max_temp,
            min_rpm,
            max_rpm,
            formula,
        };
        curve.validate()?;
        Ok(curve)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min_rpm.is_finite() || !self.max_rpm.is_finite() || self.min_rpm >= self.max_rpm {
            return Err(FanError::config(format!(
                "formula curve needs min_rpm < max_rpm (got {} and {})",
                self.min_rpm, self.max_rpm
            )));
        }
        if !self.activation_temp.is_finite() || !self.max_temp.is_finite() {
            return Err(FanError::config("formula curve temperatures must be finite"));
        }
        Ok(())
    }

    /// Replace the speed range with a fan's calibrated bounds.
    pub fn with_bounds(mut self, calibration: &FanCalibration) -> Self {
        self.min_rpm = calibration.min_rpm;
        self.max_rpm = calibration.max_rpm;
        self
    }

    pub fn equation(&self) -> &str {
        self.formula.source()
    }

    /// Absolute RPM requested at `temp`.
    pub fn rpm(&self, temp: f64) -> std::result::Result<f64, ExprError> {
        self.formula.eval(&Bindings {
            current_temp: temp,
            activation_temp: self.activation_temp,
            max_temp: self.max_temp,
            min_rpm: self.min_rpm,
            max_rpm: self.max_rpm,
        })
    }

    /// RPM, falling back to `min_rpm` when the expression cannot be evaluated.
    pub fn rpm_or_floor(&self, temp: f64) -> (f64, Option<ExprError>) {
        match self.rpm(temp) {
            Ok(rpm) => (rpm, None),
            Err(e) => (self.min_rpm, Some(e)),
        }
    }

    /// Position of `rpm` within this curve's speed range, clamped to `[0, 1]`.
    pub fn fraction_of(&self, rpm: f64) -> f64 {
        ((rpm - self.min_rpm) / (self.max_rpm - self.min_rpm)).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Unified spec and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CurveSpec {
    Anchor(AnchorCurve),
    Formula(FormulaCurve),
}

/// Runtime state of a single curve. Mutated only by [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CurveState {
    pub is_activated: bool,
    pub last_temp: Option<f64>,
}

impl CurveState {
    pub fn new(is_activated: bool) -> Self {
        Self {
            is_activated,
            last_temp: None,
        }
    }
}

/// Result of evaluating one curve.
#[derive(Debug, Clone, PartialEq)]
pub struct Demand {
    /// Requested intensity in `[0, 1]`.
    pub fraction: f64,
    /// Set when a formula failed and the floor was used instead.
    pub error: Option<ExprError>,
}

/// Evaluate a curve at `temp`, updating its state in place.
pub fn evaluate(spec: &CurveSpec, state: &mut CurveState, temp: f64) -> Demand {
    state.last_temp = Some(temp);
    match spec {
        CurveSpec::Anchor(curve) => {
            state.is_activated = curve.transition(state.is_activated, temp);
            let fraction = if state.is_activated && curve.in_jurisdiction(temp) {
                curve.interpolate(temp)
            } else {
                0.0
            };
            Demand {
                fraction,
                error: None,
            }
        }
        CurveSpec::Formula(curve) => {
            let (rpm, error) = curve.rpm_or_floor(temp);
            state.is_activated = temp >= curve.activation_temp;
            let mut fraction = curve.fraction_of(rpm);
            // Active or failed formulas hold the fan at min_rpm, never at idle.
            if state.is_activated || error.is_some() {
                fraction = fraction.max(f64::MIN_POSITIVE);
            }
            Demand { fraction, error }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A named curve together with its runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    pub name: String,
    pub spec: CurveSpec,
    state: CurveState,
    /// Constructed pre-activated; priming leaves such curves alone.
    preactivated: bool,
}

impl Curve {
    pub fn new(name: impl Into<String>, spec: CurveSpec) -> Self {
        Self::with_state(name, spec, false)
    }

    pub fn with_state(name: impl Into<String>, spec: CurveSpec, activated: bool) -> Self {
        Self {
            name: name.into(),
            spec,
            state: CurveState::new(activated),
            preactivated: activated,
        }
    }

    pub fn state(&self) -> &CurveState {
        &self.state
    }
}

/// Owns every curve and its state; evaluates them once per tick.
#[derive(Debug, Clone)]
pub struct CurveEngine {
    curves: Vec<Curve>,
}

impl CurveEngine {
    /// At least one governing curve is required.
    pub fn new(curves: Vec<Curve>) -> Result<Self> {
        if curves.is_empty() {
            return Err(FanError::config("at least one fan curve is required"));
        }
        for curve in &curves {
            let checked = match &curve.spec {
                CurveSpec::Anchor(c) => c.validate(),
                CurveSpec::Formula(c) => c.validate(),
            };
            checked.map_err(|e| FanError::config(format!("curve '{}': {e}", curve.name)))?;
        }
        Ok(Self { curves })
    }

    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    /// Set the initial activation of anchor curves from a first reading.
    ///
    /// A curve not constructed pre-activated starts activated iff `temp` is
    /// at or above its deactivation temperature.
    pub fn prime(&mut self, temp: f64) {
        for curve in &mut self.curves {
            if let CurveSpec::Anchor(anchor) = &curve.spec {
                if !curve.preactivated {
                    curve.state.is_activated = temp >= anchor.deactivation_temp;
                }
                curve.state.last_temp = Some(temp);
                log::debug!(
                    "Curve '{}' primed at {temp:.1}C: activated={}",
                    curve.name,
                    curve.state.is_activated
                );
            }
        }
    }

    /// Evaluate every curve at `temp`, returning their demands in order.
    ///
    /// Formula failures are logged and contribute their floor.
    pub fn evaluate_all(&mut self, temp: f64) -> Vec<f64> {
        self.curves
            .iter_mut()
            .map(|curve| {
                let was_active = curve.state.is_activated;
                let demand = evaluate(&curve.spec, &mut curve.state, temp);
                if let Some(reason) = demand.error {
                    let err = FanError::Evaluation {
                        curve: curve.name.clone(),
                        reason: reason.to_string(),
                    };
                    log::warn!("{err}; using curve floor");
                }
                if was_active != curve.state.is_activated {
                    log::info!(
                        "Curve '{}' {} at {temp:.1}C",
                        curve.name,
                        if curve.state.is_activated { "activated" } else { "deactivated" }
                    );
                }
                demand.fraction
            })
            .collect()
    }
}

/// The four anchor curves the controller ships with:
/// `(name, anchors, (activation, deactivation), jurisdiction)`.
pub fn default_anchor_curves() -> Vec<(String, AnchorCurve)> {
    let table = [
        ("baseline", (70.0, 300.0), (75.0, 70.0), (0.0, 80.0)),
        ("warm", (78.0, 100.0), (80.0, 75.0), (80.0, 90.0)),
        ("sustained", (73.0, 110.0), (82.0, 78.0), (78.0, 85.0)),
        ("hot", (60.0, 95.0), (85.0, 70.0), (90.0, 200.0)),
    ];
    table
        .into_iter()
        .map(|(name, (lo, hi), (on, off), (j_lo, j_hi))| {
            (
                name.to_string(),
                AnchorCurve {
                    temp_lo: lo,
                    temp_hi: hi,
                    activation_temp: on,
                    deactivation_temp: off,
                    jurisdiction_lo: j_lo,
                    jurisdiction_hi: j_hi,
                },
            )
        })
        .collect()
}
