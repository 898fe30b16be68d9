//! Simulated radio link.
//!
//! A background thread steps the [`QuadModel`] in real time, brings the link
//! up after a connect delay, and once telemetry has been started delivers all
//! four groups at the requested period. Position telemetry optionally carries
//! Gaussian noise from a seeded generator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use flight_control::estimate::TelemetryGroup;
use flight_control::link::{LinkError, LinkEvent, VehicleLink, RESET_ESTIMATION_PARAM};
use flight_control::{ControlOutput, TelemetrySample, TelemetrySink};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dynamics::{QuadModel, QuadState};

/// Errors raised while starting a simulation.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid simulation parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Simulation knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    /// Reported by [`VehicleLink::uri`]
    pub uri: String,
    /// Time from spawn until the link reports connected
    pub connect_delay: Duration,
    /// Physics integration step
    pub physics_step: Duration,
    /// Standard deviation of the position telemetry noise (m)
    pub position_noise: f64,
    pub seed: u64,
    /// Pretend the vehicle lacks this log variable
    pub missing_variable: Option<String>,
    /// Drop the link this long after connecting
    pub link_loss_after: Option<Duration>,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            uri: "sim://0".to_string(),
            connect_delay: Duration::from_millis(100),
            physics_step: Duration::from_millis(2),
            position_noise: 0.0,
            seed: 0,
            missing_variable: None,
            link_loss_after: None,
        }
    }
}

struct Shared {
    model: Mutex<QuadModel>,
    connected: AtomicBool,
    telemetry: Mutex<Option<(Duration, TelemetrySink)>>,
    params: Mutex<Vec<(String, String)>>,
    setpoints: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// [`VehicleLink`] backed by a simulated quadrotor.
///
/// Dropping the link stops the simulation thread.
pub struct SimLink {
    settings: SimSettings,
    shared: Arc<Shared>,
    events_rx: Receiver<LinkEvent>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SimLink {
    /// Start simulating `model`.
    pub fn spawn(model: QuadModel, settings: SimSettings) -> Result<Self, SimError> {
        if settings.physics_step.is_zero() {
            return Err(SimError::InvalidParameter(
                "physics_step must be positive".to_string(),
            ));
        }
        let noise = Normal::new(0.0, settings.position_noise).map_err(|e| {
            SimError::InvalidParameter(format!(
                "position_noise {}: {e}",
                settings.position_noise
            ))
        })?;

        let shared = Arc::new(Shared {
            model: Mutex::new(model),
            connected: AtomicBool::new(false),
            telemetry: Mutex::new(None),
            params: Mutex::new(Vec::new()),
            setpoints: AtomicU64::new(0),
        });
        let (events_tx, events_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let worker = Worker {
            settings: settings.clone(),
            shared: shared.clone(),
            events: events_tx,
            rng: StdRng::seed_from_u64(settings.seed),
            noise,
        };
        let thread = thread::Builder::new()
            .name("quad-sim".into())
            .spawn(move || worker.run(stop_rx))?;

        Ok(Self {
            settings,
            shared,
            events_rx,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Observer that stays usable after the link is handed to a control loop.
    pub fn state_probe(&self) -> SimProbe {
        SimProbe {
            shared: self.shared.clone(),
        }
    }

    /// True vehicle state, free of telemetry noise.
    pub fn state(&self) -> QuadState {
        self.state_probe().state()
    }

    pub fn motors_locked(&self) -> bool {
        self.state_probe().motors_locked()
    }

    /// Setpoints accepted so far.
    pub fn setpoint_count(&self) -> u64 {
        self.state_probe().setpoint_count()
    }

    /// Parameter writes received so far.
    pub fn params(&self) -> Vec<(String, String)> {
        lock(&self.shared.params).clone()
    }
}

/// Read-only view of a running simulation.
#[derive(Clone)]
pub struct SimProbe {
    shared: Arc<Shared>,
}

impl SimProbe {
    pub fn state(&self) -> QuadState {
        *lock(&self.shared.model).state()
    }

    pub fn motors_locked(&self) -> bool {
        lock(&self.shared.model).motors_locked()
    }

    pub fn setpoint_count(&self) -> u64 {
        self.shared.setpoints.load(Ordering::Relaxed)
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl VehicleLink for SimLink {
    fn uri(&self) -> &str {
        &self.settings.uri
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn start_telemetry(&mut self, period: Duration, sink: TelemetrySink) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if let Some(name) = &self.settings.missing_variable {
            let known = TelemetryGroup::ALL
                .iter()
                .any(|g| g.variables().contains(&name.as_str()));
            if known {
                return Err(LinkError::MissingVariable(name.clone()));
            }
        }
        *lock(&self.shared.telemetry) = Some((period, sink));
        debug!("Telemetry started at {period:?}");
        Ok(())
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if name != RESET_ESTIMATION_PARAM {
            return Err(LinkError::Rejected(format!("unknown parameter {name}")));
        }
        if value == "1" {
            debug!("Estimator reset");
        }
        lock(&self.shared.params).push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send_setpoint(&mut self, setpoint: &ControlOutput) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        lock(&self.shared.model).apply_setpoint(setpoint);
        self.shared.setpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn events(&self) -> Receiver<LinkEvent> {
        self.events_rx.clone()
    }
}

struct Worker {
    settings: SimSettings,
    shared: Arc<Shared>,
    events: Sender<LinkEvent>,
    rng: StdRng,
    noise: Normal<f64>,
}

impl Worker {
    fn run(mut self, stop: Receiver<()>) {
        let started = Instant::now();
        let mut last_step = started;
        let mut connected_at: Option<Instant> = None;
        let mut last_delivery: Option<Instant> = None;

        loop {
            match stop.recv_timeout(self.settings.physics_step) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();

            if connected_at.is_none() && now.duration_since(started) >= self.settings.connect_delay
            {
                connected_at = Some(now);
                self.shared.connected.store(true, Ordering::Release);
                info!("Simulated vehicle connected");
                let _ = self.events.send(LinkEvent::Connected {
                    uri: self.settings.uri.clone(),
                });
            }

            if let (Some(at), Some(after)) = (connected_at, self.settings.link_loss_after) {
                if self.shared.connected.load(Ordering::Acquire)
                    && now.duration_since(at) >= after
                {
                    self.shared.connected.store(false, Ordering::Release);
                    lock(&self.shared.telemetry).take();
                    warn!("Simulated link lost");
                    let _ = self.events.send(LinkEvent::ConnectionLost {
                        uri: self.settings.uri.clone(),
                        message: "simulated link loss".to_string(),
                    });
                }
            }

            // Cap the step so a stalled thread does not launch the vehicle
            let dt = now.duration_since(last_step).as_secs_f64().min(0.05);
            last_step = now;
            let state = {
                let mut model = lock(&self.shared.model);
                model.step(dt);
                *model.state()
            };

            let telemetry = lock(&self.shared.telemetry).clone();
            if let Some((period, sink)) = telemetry {
                let due = last_delivery.map_or(true, |t| now.duration_since(t) >= period);
                if due {
                    last_delivery = Some(now);
                    self.deliver(&sink, &state);
                }
            }
        }

        if self.shared.connected.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(LinkEvent::Disconnected {
                uri: self.settings.uri.clone(),
            });
        }
    }

    fn deliver(&mut self, sink: &TelemetrySink, state: &QuadState) {
        let q = state.attitude();
        sink.deliver(TelemetrySample::Attitude {
            q0: q.w,
            q1: q.i,
            q2: q.j,
            q3: q.k,
        });
        sink.deliver(TelemetrySample::Stabilizer {
            roll: state.roll,
            pitch: state.pitch,
            yaw: state.yaw,
        });
        sink.deliver(TelemetrySample::Velocity {
            body: state.body_velocity(),
            yaw_rate: state.yaw_rate,
        });

        let mut position = state.position;
        if self.settings.position_noise > 0.0 {
            for axis in position.iter_mut() {
                *axis += self.noise.sample(&mut self.rng);
            }
        }
        sink.deliver(TelemetrySample::Position {
            x: position.x,
            y: position.y,
            z: position.z,
        });
    }
}
