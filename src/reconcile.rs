// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The closed control loop.
//!
//! Every tick: sample -> compute -> command -> wait -> verify -> correct.
//! Whatever ends the loop (cancellation, probe failure, any other fatal
//! error), every fan is set back to automatic mode before [`ReconciliationLoop::run`]
//! returns. [`ReconciliationLoop::start`] and [`supervise`] cover the paths
//! the loop itself never sees: a failed startup and a dead control task.

use crate::arbiter::SpeedArbiter;
use crate::calibration::{ControlTick, FanMode};
use crate::config::{self, Config};
use crate::curve::CurveEngine;
use crate::device::{self, Actuator, FanReading, Probe, TemperatureSource};
use crate::error::{FanError, Result};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Loop timing and verification parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    /// Inclusive RPM tolerance for a fan to count as converged.
    pub rpm_tolerance: u32,
    pub temperature_source: TemperatureSource,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_interval: config.daemon.tick_interval(),
            rpm_tolerance: config.daemon.rpm_tolerance,
            temperature_source: config.daemon.temperature_source,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(config::DEFAULT_TICK_INTERVAL_MS),
            rpm_tolerance: config::DEFAULT_RPM_TOLERANCE,
            temperature_source: TemperatureSource::HighestCpu,
        }
    }
}

/// Whether a fan has converged on its commanded speed.
///
/// The fan must be forced. Its actual speed must be within `tolerance` of
/// `commanded`; for a commanded 0 the reported target is compared instead,
/// since a physical fan may not stop.
pub fn is_in_order(reading: &FanReading, commanded: u32, tolerance: u32) -> bool {
    if reading.mode != FanMode::Forced {
        return false;
    }
    let observed = if commanded == 0 {
        reading.target_speed
    } else {
        reading.actual_speed
    };
    (observed.round() - f64::from(commanded)).abs() <= f64::from(tolerance)
}

pub struct ReconciliationLoop<P, A> {
    probe: P,
    actuator: A,
    engine: CurveEngine,
    arbiter: SpeedArbiter,
    settings: LoopSettings,
}

impl<P: Probe, A: Actuator> ReconciliationLoop<P, A> {
    pub fn new(
        probe: P,
        actuator: A,
        engine: CurveEngine,
        arbiter: SpeedArbiter,
        settings: LoopSettings,
    ) -> Self {
        Self {
            probe,
            actuator,
            engine,
            arbiter,
            settings,
        }
    }

    /// Calibrate, build and prime a loop from `config`.
    ///
    /// Profile paths resolve against `base_dir`. If anything fails, every
    /// configured fan is returned to automatic mode before the error is
    /// handed back.
    pub async fn start(config: &Config, base_dir: &Path, mut probe: P, mut actuator: A) -> Result<Self> {
        match assemble(config, base_dir, &mut probe).await {
            Ok((engine, arbiter)) => Ok(Self::new(
                probe,
                actuator,
                engine,
                arbiter,
                LoopSettings::from_config(config),
            )),
            Err(e) => {
                log::error!("Startup failed: {e}");
                device::restore_all_automatic(&mut actuator, &config.fan_ids()).await;
                Err(e)
            }
        }
    }

    pub fn engine(&self) -> &CurveEngine {
        &self.engine
    }

    /// Run until cancelled or a fatal error, then restore automatic mode.
    ///
    /// Returns [`FanError::Interrupted`] when stopped through `shutdown`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let result = self.run_ticks(&mut shutdown).await;
        match &result {
            Err(FanError::Interrupted) => log::info!("Control loop interrupted"),
            Err(e) => log::error!("Control loop stopped: {e}"),
            Ok(()) => {}
        }
        self.restore().await;
        result
    }

    /// Hand every fan back to the firmware.
    pub async fn restore(&mut self) {
        let ids = self.arbiter.fan_ids();
        device::restore_all_automatic(&mut self.actuator, &ids).await;
    }

    async fn run_ticks(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.prepare().await;

        loop {
            let stop = *shutdown.borrow();
            if stop {
                return Err(FanError::Interrupted);
            }

            let tick = self.apply_tick().await?;

            if wait_or_cancel(self.settings.tick_interval, shutdown).await {
                return Err(FanError::Interrupted);
            }

            self.verify(&tick).await?;
        }
    }

    /// Cycle every fan auto -> forced so the loop starts from a known mode.
    pub async fn prepare(&mut self) {
        for fan_id in self.arbiter.fan_ids() {
            if let Err(e) = device::cycle_mode(&mut self.actuator, fan_id).await {
                log::warn!("{e}");
            }
        }
        log::info!("Prepared {} fan(s) for forced control", self.arbiter.fans().len());
    }

    /// Sample, compute and command one tick.
    pub async fn apply_tick(&mut self) -> Result<ControlTick> {
        let tick = self.compute().await?;

        if !tick.has_demand() {
            log::debug!("No active demand at {:.1}C; fans idle", tick.temperature);
        }

        for target in &tick.targets {
            if let Err(e) = self.actuator.set_mode(target.fan_id, FanMode::Forced).await {
                log::warn!("{e}");
            }
            match self.actuator.set_speed(target.fan_id, target.rpm).await {
                Ok(()) => log::debug!("Fan {} set to {} RPM", target.fan_id, target.rpm),
                Err(e) => log::warn!("{e}"),
            }
        }

        Ok(tick)
    }

    /// Sample the probe and evaluate every curve.
    pub async fn compute(&mut self) -> Result<ControlTick> {
        let report = self.probe.query_all().await?;
        let temperature = report.governing(self.settings.temperature_source)?;

        let fractions = self.engine.evaluate_all(temperature);
        let fraction = self.arbiter.arbitrate(&fractions)?;
        let targets = self.arbiter.targets(fraction);

        log::debug!(
            "Temperature {temperature:.1}C, demands {fractions:?}, arbitrated {fraction:.3}"
        );

        Ok(ControlTick {
            temperature,
            fractions,
            fraction,
            targets,
        })
    }

    /// Re-query fan status and re-arm every fan that has not converged.
    ///
    /// Returns the ids of the fans that were corrected.
    pub async fn verify(&mut self, tick: &ControlTick) -> Result<Vec<u32>> {
        let report = self.probe.query_fans().await?;
        let mut corrected = Vec::new();

        for target in &tick.targets {
            let in_order = report
                .get(target.fan_id)
                .is_some_and(|r| is_in_order(r, target.rpm, self.settings.rpm_tolerance));

            if in_order {
                log::debug!("Fan {} in order at {} RPM", target.fan_id, target.rpm);
                continue;
            }

            log::warn!(
                "Fan {} not in order (commanded {} RPM), re-arming",
                target.fan_id,
                target.rpm
            );
            if let Err(e) = device::cycle_mode(&mut self.actuator, target.fan_id).await {
                log::warn!("{e}");
            }
            corrected.push(target.fan_id);
        }

        Ok(corrected)
    }
}

async fn assemble<P: Probe>(
    config: &Config,
    base_dir: &Path,
    probe: &mut P,
) -> Result<(CurveEngine, SpeedArbiter)> {
    let fan_report = if config.needs_calibration() {
        Some(probe.query_fans().await?)
    } else {
        None
    };
    let fans = config.calibrations(fan_report.as_ref())?;
    for fan in &fans {
        log::info!("Fan {}: {} - {} RPM", fan.fan_id, fan.min_rpm, fan.max_rpm);
    }

    let curves = config.build_curves(base_dir, &fans)?;
    log::info!("Loaded {} curve(s)", curves.len());
    let mut engine = CurveEngine::new(curves)?;

    // Start each curve in the activation state matching the current temperature.
    let initial = probe
        .query_all()
        .await?
        .governing(config.daemon.temperature_source)?;
    engine.prime(initial);
    log::info!("Initial temperature {initial:.1}C");

    Ok((engine, SpeedArbiter::new(fans)?))
}

/// Return every configured fan to automatic mode without taking control.
pub async fn release<A: Actuator>(actuator: &mut A, config: &Config) {
    log::info!("Controller is off, returning fans to automatic control");
    device::restore_all_automatic(actuator, &config.fan_ids()).await;
}

/// Wait for a spawned [`ReconciliationLoop::run`] to finish.
///
/// A cancelled run counts as a clean stop. If the task panicked or was
/// aborted, `actuator` returns every fan in `fan_ids` to automatic mode.
pub async fn supervise<A: Actuator>(
    task: JoinHandle<Result<()>>,
    actuator: &mut A,
    fan_ids: &[u32],
) -> Result<()> {
    match task.await {
        Ok(Ok(())) | Ok(Err(FanError::Interrupted)) => {
            log::info!("Fan controller stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(join_err) => {
            log::error!("Control loop aborted: {join_err}");
            device::restore_all_automatic(actuator, fan_ids).await;
            Err(FanError::Aborted(join_err.to_string()))
        }
    }
}

/// Sleep for `interval` unless shutdown is requested first.
///
/// Returns true if shutdown was requested.
async fn wait_or_cancel(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let deadline = Instant::now() + interval;
    tokio::select! {
        _ = time::sleep_until(deadline) => false,
        requested = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
            if !requested {
                // Sender gone: nobody can stop us through this channel anymore.
                time::sleep_until(deadline).await;
            }
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::FanCalibration;
    use crate::curve::{AnchorCurve, Curve, CurveSpec, FormulaCurve};
    use crate::device::{FanReport, SensorReport};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Cmd {
        Mode(u32, FanMode),
        Speed(u32, u32),
    }

    /// Probe returning a fixed temperature; fan report echoes the last
    /// commanded speed unless overridden.
    #[derive(Clone)]
    struct FakeProbe {
        temperature: Arc<Mutex<Option<f64>>>,
        fans: Arc<Mutex<Option<FanReport>>>,
        queries: Arc<Mutex<usize>>,
        crashed: Arc<Mutex<bool>>,
    }

    impl FakeProbe {
        fn new(temp: f64) -> Self {
            Self {
                temperature: Arc::new(Mutex::new(Some(temp))),
                fans: Arc::new(Mutex::new(None)),
                queries: Arc::new(Mutex::new(0)),
                crashed: Arc::new(Mutex::new(false)),
            }
        }

        fn set_fans(&self, report: FanReport) {
            *self.fans.lock().unwrap() = Some(report);
        }

        fn fail(&self) {
            *self.temperature.lock().unwrap() = None;
        }

        /// Make the next sample panic.
        fn crash(&self) {
            *self.crashed.lock().unwrap() = true;
        }
    }

    impl Probe for FakeProbe {
        async fn query_all(&mut self) -> Result<SensorReport> {
            *self.queries.lock().unwrap() += 1;
            let crashed = *self.crashed.lock().unwrap();
            if crashed {
                panic!("sensor driver crashed");
            }
            match *self.temperature.lock().unwrap() {
                Some(t) => Ok(SensorReport {
                    cpu_temps: vec![t],
                    gpu_temps: Vec::new(),
                }),
                None => Err(FanError::ProbeUnavailable("smc list: timed out".into())),
            }
        }

        async fn query_fans(&mut self) -> Result<FanReport> {
            self.fans
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| FanError::ProbeUnavailable("no fan report".into()))
        }
    }

    #[derive(Clone, Default)]
    struct FakeActuator {
        log: Arc<Mutex<Vec<Cmd>>>,
        reject_speed: bool,
    }

    impl FakeActuator {
        fn commands(&self) -> Vec<Cmd> {
            self.log.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.log.lock().unwrap().clear();
        }
    }

    impl Actuator for FakeActuator {
        async fn set_mode(&mut self, fan_id: u32, mode: FanMode) -> Result<()> {
            self.log.lock().unwrap().push(Cmd::Mode(fan_id, mode));
            Ok(())
        }

        async fn set_speed(&mut self, fan_id: u32, rpm: u32) -> Result<()> {
            self.log.lock().unwrap().push(Cmd::Speed(fan_id, rpm));
            if self.reject_speed {
                return Err(FanError::Actuation {
                    fan_id,
                    command: format!("set speed {rpm}"),
                    reason: "rejected".into(),
                });
            }
            Ok(())
        }
    }

    fn reading(mode: FanMode, target: f64, actual: f64) -> FanReading {
        FanReading {
            mode,
            target_speed: target,
            actual_speed: actual,
            min_speed: None,
            max_speed: None,
        }
    }

    /// A curve that is fully on from 40C upward.
    fn full_curve() -> Curve {
        Curve::new(
            "full",
            CurveSpec::Anchor(AnchorCurve::new((0.0, 40.0), (40.0, 30.0), (0.0, 200.0)).unwrap()),
        )
    }

    fn build(
        probe: FakeProbe,
        actuator: FakeActuator,
        curves: Vec<Curve>,
        fans: Vec<FanCalibration>,
        tick_interval: Duration,
    ) -> ReconciliationLoop<FakeProbe, FakeActuator> {
        ReconciliationLoop::new(
            probe,
            actuator,
            CurveEngine::new(curves).unwrap(),
            SpeedArbiter::new(fans).unwrap(),
            LoopSettings {
                tick_interval,
                ..LoopSettings::default()
            },
        )
    }

    fn fan(id: u32) -> FanCalibration {
        FanCalibration::new(id, 2317.0, 6898.0).unwrap()
    }

    fn restored_all(commands: &[Cmd], fan_ids: &[u32]) -> bool {
        // The last command issued to each fan must be "set mode auto".
        fan_ids.iter().all(|&id| {
            commands
                .iter()
                .rev()
                .find(|c| matches!(c, Cmd::Mode(f, _) | Cmd::Speed(f, _) if *f == id))
                == Some(&Cmd::Mode(id, FanMode::Auto))
        })
    }

    #[test]
    fn test_in_order_within_tolerance() {
        let r = reading(FanMode::Forced, 4000.0, 3990.0);
        assert!(is_in_order(&r, 4000, 10));
        assert!(!is_in_order(&reading(FanMode::Forced, 4000.0, 3500.0), 4000, 10));
        assert!(!is_in_order(&reading(FanMode::Auto, 4000.0, 4000.0), 4000, 10));
        assert!(is_in_order(&reading(FanMode::Forced, 0.0, 1200.0), 0, 10));
    }

    #[tokio::test]
    async fn test_full_demand_commands_max_rpm() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator::default();
        let mut ctl = build(probe, actuator.clone(), vec![full_curve()], vec![fan(0)], Duration::ZERO);

        let tick = ctl.apply_tick().await.unwrap();
        assert_eq!(tick.fraction, 1.0);
        assert_eq!(tick.target_for(0), Some(6898));
        assert_eq!(
            actuator.commands(),
            vec![Cmd::Mode(0, FanMode::Forced), Cmd::Speed(0, 6898)]
        );
    }

    #[tokio::test]
    async fn test_no_active_demand_commands_zero() {
        let probe = FakeProbe::new(85.0);
        let actuator = FakeActuator::default();
        let curves = vec![
            Curve::new(
                "low",
                CurveSpec::Anchor(AnchorCurve::new((70.0, 300.0), (75.0, 70.0), (0.0, 80.0)).unwrap()),
            ),
            Curve::new(
                "high",
                CurveSpec::Anchor(AnchorCurve::new((60.0, 95.0), (85.0, 70.0), (90.0, 200.0)).unwrap()),
            ),
        ];
        let mut ctl = build(probe, actuator.clone(), curves, vec![fan(0)], Duration::ZERO);

        let tick = ctl.apply_tick().await.unwrap();
        assert_eq!(tick.fractions, vec![0.0, 0.0]);
        assert!(!tick.has_demand());
        assert_eq!(tick.target_for(0), Some(0));
    }

    #[tokio::test]
    async fn test_verify_accepts_fan_within_tolerance() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator::default();
        let mut ctl = build(probe.clone(), actuator.clone(), vec![full_curve()], vec![fan(0)], Duration::ZERO);

        let tick = ControlTick {
            temperature: 70.0,
            fractions: vec![0.37],
            fraction: 0.37,
            targets: vec![crate::calibration::FanTarget { fan_id: 0, rpm: 4000 }],
        };

        probe.set_fans(FanReport {
            fans: vec![reading(FanMode::Forced, 4000.0, 3990.0)],
        });
        assert!(ctl.verify(&tick).await.unwrap().is_empty());
        assert!(actuator.commands().is_empty());

        probe.set_fans(FanReport {
            fans: vec![reading(FanMode::Forced, 4000.0, 3500.0)],
        });
        assert_eq!(ctl.verify(&tick).await.unwrap(), vec![0]);
        assert_eq!(
            actuator.commands(),
            vec![Cmd::Mode(0, FanMode::Auto), Cmd::Mode(0, FanMode::Forced)]
        );
    }

    #[tokio::test]
    async fn test_verify_corrects_fan_missing_from_report() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator::default();
        let mut ctl = build(probe.clone(), actuator.clone(), vec![full_curve()], vec![fan(0), fan(1)], Duration::ZERO);

        let tick = ctl.apply_tick().await.unwrap();
        probe.set_fans(FanReport {
            fans: vec![reading(FanMode::Forced, 6898.0, 6898.0)],
        });
        actuator.clear();
        assert_eq!(ctl.verify(&tick).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_rejected_speed_is_not_fatal() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator {
            reject_speed: true,
            ..FakeActuator::default()
        };
        let mut ctl = build(probe.clone(), actuator.clone(), vec![full_curve()], vec![fan(0)], Duration::ZERO);

        let tick = ctl.apply_tick().await.unwrap();
        assert_eq!(tick.target_for(0), Some(6898));

        // The fan never left its previous speed, so verification re-arms it.
        probe.set_fans(FanReport {
            fans: vec![reading(FanMode::Forced, 2317.0, 2320.0)],
        });
        actuator.clear();
        assert_eq!(ctl.verify(&tick).await.unwrap(), vec![0]);
        assert_eq!(
            actuator.commands(),
            vec![Cmd::Mode(0, FanMode::Auto), Cmd::Mode(0, FanMode::Forced)]
        );
    }

    fn formula_curve(equation: &str) -> Curve {
        Curve::new(
            "profile",
            CurveSpec::Formula(FormulaCurve::new(55.0, 95.0, 2317.0, 6898.0, equation).unwrap()),
        )
    }

    const LINEAR: &str =
        "min_rpm + (max_rpm - min_rpm) * (current_temp - activation_temp) / (max_temp - activation_temp)";

    #[tokio::test]
    async fn test_formula_at_activation_commands_min_rpm() {
        let probe = FakeProbe::new(55.0);
        let actuator = FakeActuator::default();
        let mut ctl = build(probe, actuator.clone(), vec![formula_curve(LINEAR)], vec![fan(0)], Duration::ZERO);

        let tick = ctl.apply_tick().await.unwrap();
        assert!(tick.has_demand());
        assert_eq!(tick.target_for(0), Some(2317));
        assert_eq!(
            actuator.commands(),
            vec![Cmd::Mode(0, FanMode::Forced), Cmd::Speed(0, 2317)]
        );
    }

    #[tokio::test]
    async fn test_formula_above_activation_scales() {
        let probe = FakeProbe::new(56.0);
        let mut ctl = build(probe, FakeActuator::default(), vec![formula_curve(LINEAR)], vec![fan(0)], Duration::ZERO);
        assert_eq!(ctl.apply_tick().await.unwrap().target_for(0), Some(2432));
    }

    #[tokio::test]
    async fn test_failing_formula_commands_min_rpm() {
        let probe = FakeProbe::new(90.0);
        let actuator = FakeActuator::default();
        let curves = vec![formula_curve("exp(current_temp * 50)")];
        let mut ctl = build(probe, actuator.clone(), curves, vec![fan(0)], Duration::ZERO);

        let tick = ctl.apply_tick().await.unwrap();
        assert_eq!(tick.target_for(0), Some(2317));
        assert!(actuator.commands().contains(&Cmd::Speed(0, 2317)));
    }

    #[tokio::test]
    async fn test_formula_below_activation_idles() {
        let probe = FakeProbe::new(40.0);
        let mut ctl = build(probe, FakeActuator::default(), vec![formula_curve(LINEAR)], vec![fan(0)], Duration::ZERO);
        assert_eq!(ctl.apply_tick().await.unwrap().target_for(0), Some(0));
    }

    #[tokio::test]
    async fn test_startup_cycles_every_fan() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator::default();
        let mut ctl = build(probe, actuator.clone(), vec![full_curve()], vec![fan(0), fan(1)], Duration::ZERO);

        ctl.prepare().await;
        assert_eq!(
            actuator.commands(),
            vec![
                Cmd::Mode(0, FanMode::Auto),
                Cmd::Mode(0, FanMode::Forced),
                Cmd::Mode(1, FanMode::Auto),
                Cmd::Mode(1, FanMode::Forced),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_restores_automatic_mode() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator::default();
        let mut ctl = build(probe.clone(), actuator.clone(), vec![full_curve()], vec![fan(0), fan(1)], Duration::ZERO);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = ctl.run(rx).await;

        assert_eq!(result, Err(FanError::Interrupted));
        assert_eq!(*probe.queries.lock().unwrap(), 0);
        assert!(restored_all(&actuator.commands(), &[0, 1]));
    }

    #[tokio::test]
    async fn test_probe_failure_restores_automatic_mode() {
        let probe = FakeProbe::new(95.0);
        probe.fail();
        let actuator = FakeActuator::default();
        let mut ctl = build(probe, actuator.clone(), vec![full_curve()], vec![fan(0), fan(1)], Duration::ZERO);

        let (_tx, rx) = watch::channel(false);
        let result = ctl.run(rx).await;

        assert!(matches!(result, Err(FanError::ProbeUnavailable(_))));
        assert!(restored_all(&actuator.commands(), &[0, 1]));
    }

    #[tokio::test]
    async fn test_failure_after_running_ticks_restores_automatic_mode() {
        let probe = FakeProbe::new(95.0);
        probe.set_fans(FanReport {
            fans: vec![reading(FanMode::Forced, 6898.0, 6898.0)],
        });
        let actuator = FakeActuator::default();
        let mut ctl = build(probe.clone(), actuator.clone(), vec![full_curve()], vec![fan(0)], Duration::from_millis(5));

        let (_tx, rx) = watch::channel(false);
        let failing = probe.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(30)).await;
            failing.fail();
        });

        let result = time::timeout(Duration::from_secs(5), ctl.run(rx)).await.unwrap();
        assert!(matches!(result, Err(FanError::ProbeUnavailable(_))));

        let commands = actuator.commands();
        assert!(commands.contains(&Cmd::Speed(0, 6898)));
        assert!(restored_all(&commands, &[0]));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_long_sleep() {
        let probe = FakeProbe::new(95.0);
        probe.set_fans(FanReport {
            fans: vec![reading(FanMode::Forced, 6898.0, 6898.0)],
        });
        let actuator = FakeActuator::default();
        let mut ctl = build(probe, actuator.clone(), vec![full_curve()], vec![fan(0)], Duration::from_secs(3600));

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let result = time::timeout(Duration::from_secs(5), ctl.run(rx)).await.unwrap();
        assert_eq!(result, Err(FanError::Interrupted));
        assert!(restored_all(&actuator.commands(), &[0]));
    }

    #[tokio::test]
    async fn test_start_primes_from_current_temperature() {
        let probe = FakeProbe::new(95.0);
        let actuator = FakeActuator::default();
        let ctl = ReconciliationLoop::start(&Config::default(), Path::new("."), probe, actuator.clone())
            .await
            .unwrap();

        assert!(ctl.engine().curves().iter().any(|c| c.state().is_activated));
        assert!(actuator.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_restores_automatic_mode() {
        let probe = FakeProbe::new(95.0);
        probe.fail();
        let actuator = FakeActuator::default();
        let result = ReconciliationLoop::start(&Config::default(), Path::new("."), probe, actuator.clone()).await;

        assert!(matches!(result, Err(FanError::ProbeUnavailable(_))));
        assert!(restored_all(&actuator.commands(), &[0, 1]));
    }

    #[tokio::test]
    async fn test_release_restores_configured_fans() {
        let mut actuator = FakeActuator::default();
        release(&mut actuator, &Config::default()).await;
        assert_eq!(
            actuator.commands(),
            vec![Cmd::Mode(0, FanMode::Auto), Cmd::Mode(1, FanMode::Auto)]
        );
    }

    #[tokio::test]
    async fn test_panicking_loop_restores_automatic_mode() {
        let probe = FakeProbe::new(95.0);
        probe.set_fans(FanReport {
            fans: vec![
                reading(FanMode::Forced, 6898.0, 6898.0),
                reading(FanMode::Forced, 6898.0, 6898.0),
            ],
        });
        let actuator = FakeActuator::default();
        let mut ctl = build(probe.clone(), actuator.clone(), vec![full_curve()], vec![fan(0), fan(1)], Duration::from_millis(5));

        let (_tx, rx) = watch::channel(false);
        let crashing = probe.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(30)).await;
            crashing.crash();
        });

        let task = tokio::spawn(async move { ctl.run(rx).await });
        let mut fallback = actuator.clone();
        let result = time::timeout(Duration::from_secs(5), supervise(task, &mut fallback, &[0, 1]))
            .await
            .unwrap();

        assert!(matches!(result, Err(FanError::Aborted(_))));
        let commands = actuator.commands();
        assert!(commands.contains(&Cmd::Speed(0, 6898)));
        assert!(restored_all(&commands, &[0, 1]));
    }

    #[tokio::test]
    async fn test_supervise_treats_interrupt_as_clean_stop() {
        let mut actuator = FakeActuator::default();
        let task = tokio::spawn(async { Err(FanError::Interrupted) });
        assert_eq!(supervise(task, &mut actuator, &[0]).await, Ok(()));
        assert!(actuator.commands().is_empty());

        let task = tokio::spawn(async { Err(FanError::probe("smc list: timed out")) });
        assert!(matches!(
            supervise(task, &mut actuator, &[0]).await,
            Err(FanError::ProbeUnavailable(_))
        ));
        assert!(actuator.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_skip_wait() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let start = Instant::now();
        assert!(!wait_or_cancel(Duration::from_millis(30), &mut rx).await);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
