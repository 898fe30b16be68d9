//! Fixed-rate control loop and its arm/disarm state machine.
//!
//! The loop owns the vehicle link. Other threads talk to it through a
//! [`ControlHandle`]: arm/disarm and trim requests are queued and applied at
//! the start of the next tick, reference edits land in a shared slot that is
//! read once per tick.
//!
//! Each tick:
//! 1. apply queued commands
//! 2. take one snapshot each of the configuration, the estimate and the
//!    reference
//! 3. while armed, run the position sanity check
//! 4. evaluate the control law
//! 5. while armed, dispatch the setpoint and queue a flight log record
//! 6. publish status, then sleep out the rest of the period
//!
//! The loop disarms itself on a safety violation, a non-finite command or a
//! refused setpoint, and always disarms before exiting.

mod handle;
mod scheduler;

pub use handle::{Command, ControlHandle, Fault, LoopPhase, LoopStatus};
pub use scheduler::{Pacing, Scheduler};

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConfigHandle;
use crate::control_law::{self, ControlInput, ControlStep};
use crate::estimate::{StateEstimate, StateEstimateStore, TelemetryGroup};
use crate::flight_log::{FlightLog, FlightLogError, FlightLogSummary, FlightRecord};
use crate::link::{LinkError, VehicleLink};
use crate::safety::{SafetyError, SafetyMonitor};
use crate::setpoint::{ControlOutput, IntegralState, Reference};

/// Errors that end the control loop.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The link never came up.
    #[error("No connection to {uri} within {timeout:?}")]
    ConnectionTimeout { uri: String, timeout: Duration },

    /// Some telemetry groups never arrived after the estimator reset.
    #[error("Telemetry incomplete, never received: {missing:?}")]
    TelemetryIncomplete { missing: Vec<TelemetryGroup> },

    /// The initial position estimate is out of bounds.
    #[error("Safety check failed: {0}")]
    Safety(#[from] SafetyError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Flight log error: {0}")]
    FlightLog(#[from] FlightLogError),

    /// Shutdown was requested before startup finished.
    #[error("Shutdown requested during startup")]
    Cancelled,
}

/// Loop parameters fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    /// Control period
    pub period: Duration,
    /// Telemetry delivery period requested from the link
    pub telemetry_period: Duration,
    /// Thrust trim step in device units
    pub thrust_step: u16,
    /// Thrust reported while disarmed, before any trim
    pub idle_thrust: u16,
    /// Altitude of the reference seeded at startup (m)
    pub takeoff_altitude: f64,
    pub connect_timeout: Duration,
    pub connect_poll: Duration,
    /// How long the estimator reset flag is held
    pub reset_pulse: Duration,
    /// Fixed wait after the estimator reset
    pub warmup: Duration,
    /// How long to wait for every telemetry group after the warm-up
    pub telemetry_timeout: Duration,
    /// Interval between status debug messages
    pub status_interval: Duration,
    /// Run the position sanity check on every armed tick
    pub check_safety_each_tick: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(20),
            telemetry_period: Duration::from_millis(20),
            thrust_step: 5000,
            idle_thrust: 0,
            takeoff_altitude: 1.0,
            connect_timeout: Duration::from_secs(10),
            connect_poll: Duration::from_millis(200),
            reset_pulse: Duration::from_millis(100),
            warmup: Duration::from_millis(1500),
            telemetry_timeout: Duration::from_secs(2),
            status_interval: Duration::from_millis(500),
            check_safety_each_tick: true,
        }
    }
}

/// Whether the loop should keep ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Shutdown,
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSummary {
    pub ticks: u64,
    pub deadline_misses: u64,
    pub flight_log: Option<FlightLogSummary>,
}

/// The control loop. Build it, hand out [`ControlHandle`]s, then [`run`] or
/// [`spawn`] it.
///
/// [`run`]: ControlLoop::run
/// [`spawn`]: ControlLoop::spawn
pub struct ControlLoop<L: VehicleLink> {
    link: L,
    store: StateEstimateStore,
    config: ConfigHandle,
    settings: LoopSettings,
    handle: ControlHandle,
    commands: Receiver<Command>,
    scheduler: Scheduler,
    flight_log: Option<FlightLog>,
    armed: bool,
    integral: IntegralState,
    output: ControlOutput,
    ticks: u64,
    started: Instant,
    last_status_log: Option<Instant>,
}

impl<L: VehicleLink> ControlLoop<L> {
    pub fn new(
        link: L,
        store: StateEstimateStore,
        config: ConfigHandle,
        settings: LoopSettings,
    ) -> Self {
        let (handle, commands) = ControlHandle::new();
        let output = ControlOutput::idle(settings.idle_thrust);
        handle.update_status(|s| s.thrust = output.thrust);
        Self {
            link,
            store,
            config,
            scheduler: Scheduler::new(settings.period),
            settings,
            handle,
            commands,
            flight_log: None,
            armed: false,
            integral: IntegralState::ZERO,
            output,
            ticks: 0,
            started: Instant::now(),
            last_status_log: None,
        }
    }

    /// Record every armed tick to `log`.
    pub fn with_flight_log(mut self, log: FlightLog) -> Self {
        self.flight_log = Some(log);
        self
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Setpoint dispatched on the latest armed tick, or the idle output.
    pub fn last_output(&self) -> ControlOutput {
        self.output
    }

    pub fn integral(&self) -> IntegralState {
        self.integral
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    fn shutdown_requested(&self) -> bool {
        self.commands.try_iter().any(|c| c == Command::Shutdown)
    }

    fn wait_for_connection(&self) -> Result<(), ControlError> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        while !self.link.is_connected() {
            if self.shutdown_requested() {
                return Err(ControlError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(ControlError::ConnectionTimeout {
                    uri: self.link.uri().to_string(),
                    timeout: self.settings.connect_timeout,
                });
            }
            thread::sleep(self.settings.connect_poll);
        }
        Ok(())
    }

    fn wait_for_telemetry(&self) -> Result<(), ControlError> {
        let deadline = Instant::now() + self.settings.telemetry_timeout;
        loop {
            let missing = self.store.missing_groups();
            if missing.is_empty() {
                return Ok(());
            }
            if self.shutdown_requested() {
                return Err(ControlError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(ControlError::TelemetryIncomplete { missing });
            }
            thread::sleep(self.settings.period);
        }
    }

    /// Bring the link up, reset the estimator, check the estimate and seed
    /// the reference above the current position.
    pub fn startup(&mut self) -> Result<Reference, ControlError> {
        self.wait_for_connection()?;
        info!("Link to {} is up", self.link.uri());

        self.link
            .start_telemetry(self.settings.telemetry_period, self.store.sink())?;

        debug!("Waiting for position estimate to be good enough...");
        self.link.reset_estimator(self.settings.reset_pulse)?;
        thread::sleep(self.settings.warmup);
        self.wait_for_telemetry()?;

        let estimate = self.store.snapshot();
        let monitor = SafetyMonitor::new(self.config.snapshot().envelope);
        if let Err(e) = monitor.check(&estimate.position) {
            error!("Startup aborted: {e}");
            return Err(e.into());
        }

        let reference = Reference::new(
            estimate.position.x,
            estimate.position.y,
            self.settings.takeoff_altitude,
            0.0,
        );
        self.handle.seed_reference(reference);
        debug!("Initial positional reference: {:?}", reference.position);
        debug!("Initial thrust reference: {}", self.output.thrust);

        for command in self.commands.try_iter() {
            if command == Command::Shutdown {
                return Err(ControlError::Cancelled);
            }
            debug!("Discarding {command:?} queued during startup");
        }

        self.handle.update_status(|s| s.phase = LoopPhase::Running);
        Ok(reference)
    }

    fn record_fault(&self, fault: Fault) {
        self.handle.update_status(|s| s.last_fault = Some(fault));
    }

    fn publish_arm_state(&self) {
        let (armed, thrust) = (self.armed, self.output.thrust);
        self.handle.update_status(|s| {
            s.armed = armed;
            s.thrust = thrust;
        });
    }

    fn enable(&mut self) {
        if self.armed {
            return;
        }

        let config = self.config.snapshot();
        let position = self.store.snapshot().position;
        if let Err(e) = SafetyMonitor::new(config.envelope).check(&position) {
            error!("Refusing to enable: {e}");
            self.record_fault(e.into());
            return;
        }

        // A zero setpoint unlocks the vehicle's commander
        if let Err(e) = self.link.send_setpoint(&ControlOutput::ZERO) {
            error!("Refusing to enable, unlock setpoint failed: {e}");
            self.record_fault(e.into());
            return;
        }

        info!("Enabling controller");
        self.integral = IntegralState::ZERO;
        self.armed = true;
        self.publish_arm_state();
    }

    fn disable(&mut self, fault: Option<Fault>) {
        if let Err(e) = self.link.send_setpoint(&ControlOutput::ZERO) {
            warn!("Failed to send stop setpoint: {e}");
        }
        if self.armed {
            info!("Disabling controller");
        }
        self.armed = false;
        self.output = ControlOutput::idle(self.settings.idle_thrust);
        if let Some(fault) = fault {
            self.record_fault(fault);
        }
        self.publish_arm_state();
    }

    fn trim_thrust(&mut self, up: bool) {
        let step = self.settings.thrust_step;
        self.output.thrust = if up {
            self.output.thrust.saturating_add(step)
        } else {
            self.output.thrust.saturating_sub(step)
        };
        if self.armed {
            debug!("Thrust trim has no effect while armed");
        }
        self.publish_arm_state();
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Enable => self.enable(),
            Command::Disable => self.disable(None),
            Command::IncreaseThrust => self.trim_thrust(true),
            Command::DecreaseThrust => self.trim_thrust(false),
            Command::Shutdown => {}
        }
    }

    fn log_status(
        &mut self,
        now: Instant,
        reference: &Reference,
        estimate: &StateEstimate,
        step: &ControlStep,
    ) {
        if let Some(last) = self.last_status_log {
            if now.saturating_duration_since(last) < self.settings.status_interval {
                return;
            }
        }
        self.last_status_log = Some(now);

        let (r, p, v, e) = (
            reference.position,
            estimate.position,
            estimate.velocity,
            step.error.position,
        );
        let out = &step.output;
        debug!(
            "ref: ({:.3}, {:.3}, {:.3}, {:.1}) pos: ({:.3}, {:.3}, {:.3}, {:.1}) \
             vel: ({:.3}, {:.3}, {:.3}, {:.1}) error: ({:.3}, {:.3}, {:.3}, {:.1}, {:.2}) \
             control: ({:.2}, {:.2}, {}, {:.2})",
            r.x,
            r.y,
            r.z,
            reference.yaw_degrees(),
            p.x,
            p.y,
            p.z,
            estimate.stabilizer.z,
            v.x,
            v.y,
            v.z,
            estimate.yaw_rate,
            e.x,
            e.y,
            e.z,
            step.error.yaw,
            step.integral.height,
            out.roll,
            out.pitch,
            out.thrust,
            out.yaw_rate
        );
    }

    /// Run one tick without pacing.
    pub fn tick(&mut self) -> TickOutcome {
        while let Ok(command) = self.commands.try_recv() {
            if command == Command::Shutdown {
                return TickOutcome::Shutdown;
            }
            self.apply(command);
        }

        let now = Instant::now();
        let config = self.config.snapshot();
        let estimate = self.store.snapshot();
        let (reference, generation) = self.handle.reference_with_generation();

        if self.armed && self.settings.check_safety_each_tick {
            if let Err(e) = SafetyMonitor::new(config.envelope).check(&estimate.position) {
                error!("Disarming: {e}");
                self.disable(Some(e.into()));
            }
        }

        let step = control_law::compute(ControlInput {
            estimate: &estimate,
            reference: &reference,
            integral: self.integral,
            config: &config,
            armed: self.armed,
        });

        if self.armed {
            if step.is_dispatchable() {
                if step.tilt_saturated {
                    trace!("Tilt compensation saturated");
                }
                self.integral = step.integral;
                self.output = step.output;
                match self.link.send_setpoint(&step.output) {
                    Ok(()) => self.record_flight(now, &reference, &estimate),
                    Err(e) => {
                        error!("Failed to send setpoint: {e}");
                        self.disable(Some(e.into()));
                    }
                }
            } else {
                error!("Rejecting non-finite control output {:?}", step.raw);
                self.disable(Some(Fault::NonFiniteOutput(step.raw)));
            }
        }

        self.log_status(now, &reference, &estimate, &step);

        self.ticks += 1;
        let (armed, thrust, ticks) = (self.armed, self.output.thrust, self.ticks);
        self.handle.update_status(|s| {
            s.armed = armed;
            s.thrust = thrust;
            s.error_magnitude = step.error.magnitude;
            s.reference_generation = generation;
            s.tick_count = ticks;
        });

        TickOutcome::Continue
    }

    fn record_flight(&self, now: Instant, reference: &Reference, estimate: &StateEstimate) {
        if let Some(log) = &self.flight_log {
            log.record(FlightRecord {
                t: now.saturating_duration_since(self.started).as_secs_f64(),
                setpoint: self.output,
                reference: *reference,
                estimate: *estimate,
            });
        }
    }

    /// Tick at the configured period until shutdown is requested.
    pub fn run_ticks(&mut self) {
        self.started = Instant::now();
        loop {
            let tick_start = Instant::now();
            if self.tick() == TickOutcome::Shutdown {
                break;
            }
            if let Pacing::DeadlineMissed { overrun } = self.scheduler.pace(tick_start) {
                warn!("Deadline missed by {overrun:?}, control loop too slow");
                let misses = self.scheduler.deadline_misses();
                self.handle.update_status(|s| s.deadline_misses = misses);
            }
        }
    }

    /// Disarm, close the flight log and mark the loop stopped.
    pub fn finish(&mut self) -> Result<LoopSummary, ControlError> {
        self.disable(None);
        self.handle.update_status(|s| s.phase = LoopPhase::Stopped);

        let flight_log = match self.flight_log.take() {
            Some(log) => Some(log.close()?),
            None => None,
        };
        let summary = LoopSummary {
            ticks: self.ticks,
            deadline_misses: self.scheduler.deadline_misses(),
            flight_log,
        };
        info!(
            "Control loop stopped after {} ticks ({} deadline misses)",
            summary.ticks, summary.deadline_misses
        );
        Ok(summary)
    }

    /// Startup, tick until shutdown, then disarm.
    pub fn run(mut self) -> Result<LoopSummary, ControlError> {
        if let Err(e) = self.startup() {
            self.handle.update_status(|s| s.phase = LoopPhase::Stopped);
            return Err(e);
        }
        self.run_ticks();
        self.finish()
    }
}

impl<L: VehicleLink + 'static> ControlLoop<L> {
    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<LoopSummary, ControlError>>> {
        thread::Builder::new()
            .name("control-loop".into())
            .spawn(move || self.run())
    }
}
