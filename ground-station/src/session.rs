//! Wiring of a flight session against the simulated vehicle.
//!
//! A [`Session`] owns every background thread of a flight: the config
//! reloader, the link monitor, the control loop and the optional waypoint
//! sequencer. Dropping it without calling [`Session::finish`] still shuts the
//! loop down and joins it.

use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flight_control::config::ConfigReloader;
use flight_control::control_loop::{LoopPhase, LoopSummary};
use flight_control::link::spawn_link_monitor;
use flight_control::waypoints::{SequenceError, SequencerSettings};
use flight_control::{
    ConfigError, ConfigHandle, ControlError, ControlHandle, ControlLoop, ControllerConfig,
    FlightLog, FlightLogError, LoopSettings, StateEstimateStore, VehicleLink, WaypointSequencer,
};
use nalgebra::Vector3;
use quad_sim::{QuadModel, QuadParams, QuadState, SimError, SimLink, SimProbe, SimSettings};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),

    #[error("Flight log error: {0}")]
    FlightLog(#[from] FlightLogError),

    #[error("Control loop failed: {0}")]
    Control(#[from] ControlError),

    #[error("Control loop did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("Control loop thread panicked")]
    LoopPanicked,

    #[error("Control loop already joined")]
    AlreadyJoined,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub config_path: PathBuf,
    /// How often the config file is checked for changes
    pub reload_interval: Duration,
    /// Directory for the session flight log, `None` disables logging
    pub log_dir: Option<PathBuf>,
    pub loop_settings: LoopSettings,
    pub sim: SimSettings,
    /// Where the simulated vehicle sits at power-on
    pub start_position: Vector3<f64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.json"),
            reload_interval: Duration::from_millis(500),
            log_dir: Some(PathBuf::from(".")),
            loop_settings: LoopSettings::default(),
            sim: SimSettings::default(),
            start_position: Vector3::zeros(),
        }
    }
}

/// Simulated vehicle matching the configured mass and thrust constant.
fn sim_model(config: &ControllerConfig, start: Vector3<f64>) -> QuadModel {
    let params = QuadParams {
        mass: config.mass,
        gravity: config.gravity,
        thrust_constant: config.thrust.c,
        ..QuadParams::default()
    };
    QuadModel::new(params, QuadState::at(start))
}

pub struct Session {
    config: ConfigHandle,
    handle: ControlHandle,
    probe: SimProbe,
    control_thread: Option<JoinHandle<Result<LoopSummary, ControlError>>>,
    _reloader: ConfigReloader,
    _monitor: JoinHandle<()>,
}

impl Session {
    /// Load the config, bring up the simulated link and spawn the loop.
    pub fn start(options: SessionOptions) -> Result<Self, SessionError> {
        let config = ConfigHandle::from_file(&options.config_path)?;
        let reloader = ConfigReloader::spawn(
            options.config_path.clone(),
            config.clone(),
            options.reload_interval,
        );

        let model = sim_model(&config.snapshot(), options.start_position);
        let link = SimLink::spawn(model, options.sim)?;
        let probe = link.state_probe();
        info!("Connecting to {}", link.uri());
        let monitor = spawn_link_monitor(link.events())?;

        let mut control = ControlLoop::new(
            link,
            StateEstimateStore::new(),
            config.clone(),
            options.loop_settings,
        );
        if let Some(dir) = &options.log_dir {
            let log = FlightLog::create_in(dir)?;
            info!("Logging flight to {}", log.path().display());
            control = control.with_flight_log(log);
        }

        let handle = control.handle();
        let control_thread = control.spawn()?;

        Ok(Self {
            config,
            handle,
            probe,
            control_thread: Some(control_thread),
            _reloader: reloader,
            _monitor: monitor,
        })
    }

    pub fn handle(&self) -> &ControlHandle {
        &self.handle
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// True state of the simulated vehicle.
    pub fn vehicle(&self) -> &SimProbe {
        &self.probe
    }

    /// Block until startup finishes.
    ///
    /// A startup failure is returned as the loop's own error.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<(), SessionError> {
        match self.handle.wait_until_started(timeout) {
            LoopPhase::Running => Ok(()),
            LoopPhase::Stopped => match self.join() {
                Ok(_) => Err(SessionError::Control(ControlError::Cancelled)),
                Err(e) => Err(e),
            },
            LoopPhase::Starting => Err(SessionError::StartupTimeout(timeout)),
        }
    }

    /// Fly the configured waypoint plan on a background thread.
    ///
    /// Relative plans are anchored at the reference seeded at startup, so call
    /// this after [`Session::wait_until_ready`]. Waypoints are read from the
    /// live config as they are dispatched. The sequencer waits for the
    /// operator to arm before moving.
    pub fn spawn_waypoints(
        &self,
        settings: SequencerSettings,
    ) -> io::Result<JoinHandle<Result<(), SequenceError>>> {
        let handle = self.handle.clone();
        let config = self.config.clone();
        let initial = handle
            .initial_reference()
            .unwrap_or_else(|| handle.reference());
        info!("Loaded {} waypoints", config.snapshot().waypoints.len());

        thread::Builder::new()
            .name("waypoints".into())
            .spawn(move || {
                let mut sequencer = WaypointSequencer::new(initial, settings);
                let result = sequencer.run(&handle, &config);
                match &result {
                    Ok(()) => info!("Waypoint plan complete"),
                    Err(e) => warn!("Waypoint plan stopped: {e}"),
                }
                result
            })
    }

    fn join(&mut self) -> Result<LoopSummary, SessionError> {
        let Some(thread) = self.control_thread.take() else {
            return Err(SessionError::AlreadyJoined);
        };
        match thread.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::LoopPanicked),
        }
    }

    /// Disarm, stop the loop and close the flight log.
    pub fn finish(mut self) -> Result<LoopSummary, SessionError> {
        self.handle.shutdown();
        let summary = self.join()?;
        if let Some(log) = &summary.flight_log {
            info!(
                "Flight log {} closed: {} rows written, {} dropped",
                log.path.display(),
                log.written,
                log.dropped
            );
        }
        Ok(summary)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(thread) = self.control_thread.take() {
            self.handle.shutdown();
            if thread.join().is_err() {
                error!("Control loop thread panicked during shutdown");
            }
        }
    }
}

/// Write a default config to `path` if nothing is there yet.
pub fn ensure_config(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    ControllerConfig::default().save(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_options(dir: &Path) -> SessionOptions {
        SessionOptions {
            config_path: dir.join("config.json"),
            reload_interval: Duration::from_millis(50),
            log_dir: Some(dir.to_path_buf()),
            loop_settings: LoopSettings {
                connect_timeout: Duration::from_secs(2),
                connect_poll: Duration::from_millis(10),
                reset_pulse: Duration::from_millis(10),
                warmup: Duration::from_millis(50),
                ..LoopSettings::default()
            },
            sim: SimSettings {
                connect_delay: Duration::from_millis(20),
                ..SimSettings::default()
            },
            start_position: Vector3::new(0.2, 0.1, 0.0),
        }
    }

    #[test]
    fn test_ensure_config_writes_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(ensure_config(&path).unwrap());
        assert!(!ensure_config(&path).unwrap());
        assert_eq!(
            ControllerConfig::load(&path).unwrap(),
            ControllerConfig::default()
        );
    }

    #[test]
    fn test_missing_config_fails_to_start() {
        let dir = tempdir().unwrap();
        let result = Session::start(fast_options(dir.path()));
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[test]
    fn test_session_starts_and_finishes() {
        let dir = tempdir().unwrap();
        let options = fast_options(dir.path());
        ensure_config(&options.config_path).unwrap();

        let mut session = Session::start(options).unwrap();
        session.wait_until_ready(Duration::from_secs(5)).unwrap();

        let initial = session.handle().initial_reference().unwrap();
        assert!((initial.position.x - 0.2).abs() < 0.05);
        assert!(!session.handle().is_armed());
        assert!(session.vehicle().motors_locked());

        let summary = session.finish().unwrap();
        let log = summary.flight_log.unwrap();
        assert!(log.path.starts_with(dir.path()));
        assert_eq!(log.written, 0);
    }
}
