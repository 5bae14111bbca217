// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Closed-loop fan curve control for SMC-managed fans.
//!
//! The daemon samples a governing temperature, evaluates every configured
//! curve, commands the most demanding speed to each fan, then verifies the
//! hardware actually took it. Whatever stops the loop, fans are handed back
//! to automatic control.

pub mod arbiter;
pub mod calibration;
pub mod config;
pub mod curve;
pub mod device;
pub mod error;
pub mod expr;
pub mod profile;
pub mod reconcile;
pub mod smc;

pub use error::{FanError, Result};
