// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error kinds shared across the controller.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, FanError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FanError {
    /// Malformed calibration, curve or profile. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sampling failed or returned unparseable data.
    #[error("Probe unavailable: {0}")]
    ProbeUnavailable(String),

    /// A formula curve could not be evaluated for the current temperature.
    #[error("Curve '{curve}' failed to evaluate: {reason}")]
    Evaluation { curve: String, reason: String },

    /// A mode or speed command was rejected.
    #[error("Fan {fan_id}: {command} failed: {reason}")]
    Actuation {
        fan_id: u32,
        command: String,
        reason: String,
    },

    /// External cancellation (signal or explicit stop).
    #[error("Interrupted")]
    Interrupted,

    /// The control task died without running its own teardown.
    #[error("Control loop aborted: {0}")]
    Aborted(String),
}

impl FanError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        FanError::Configuration(msg.into())
    }

    pub(crate) fn probe(msg: impl Into<String>) -> Self {
        FanError::ProbeUnavailable(msg.into())
    }

    /// Whether this error must stop the control loop.
    ///
    /// Evaluation and actuation failures are absorbed within a tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FanError::Configuration(_)
                | FanError::ProbeUnavailable(_)
                | FanError::Interrupted
                | FanError::Aborted(_)
        )
    }
}
