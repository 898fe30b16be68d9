//! Seam between the controller and the radio link to the vehicle.
//!
//! The transport, the telemetry subscription machinery and the on-board
//! estimator live behind [`VehicleLink`]. The controller only needs to know
//! whether the link is up, to receive telemetry through a [`TelemetrySink`],
//! to write parameters, and to send setpoints.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::estimate::TelemetrySink;
use crate::setpoint::ControlOutput;

/// Parameter that resets the on-board Kalman estimator while set to `1`.
pub const RESET_ESTIMATION_PARAM: &str = "kalman.resetEstimation";

/// Errors reported by a vehicle link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The link is not connected.
    #[error("Link is not connected")]
    NotConnected,

    /// A telemetry variable the controller needs is missing on the vehicle.
    #[error("Telemetry variable {0} not found in the vehicle's log table")]
    MissingVariable(String),

    /// The vehicle refused a request.
    #[error("Vehicle rejected request: {0}")]
    Rejected(String),

    /// Transport-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle and telemetry notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Link established
    Connected { uri: String },
    /// Link closed normally
    Disconnected { uri: String },
    /// Link could not be established
    ConnectionFailed { uri: String, message: String },
    /// Established link dropped
    ConnectionLost { uri: String, message: String },
    /// A telemetry group reported an error
    LogError { group: String, message: String },
}

/// Radio link to the vehicle.
pub trait VehicleLink: Send {
    /// Address of the vehicle, for log messages.
    fn uri(&self) -> &str;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Subscribe to every telemetry group at `period`, delivering into `sink`.
    ///
    /// Fails with [`LinkError::MissingVariable`] if the vehicle does not
    /// expose a required variable.
    fn start_telemetry(&mut self, period: Duration, sink: TelemetrySink) -> Result<(), LinkError>;

    /// Write a parameter on the vehicle.
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), LinkError>;

    /// Send a roll/pitch/yaw-rate/thrust setpoint.
    fn send_setpoint(&mut self, setpoint: &ControlOutput) -> Result<(), LinkError>;

    /// Receiver for lifecycle notifications.
    fn events(&self) -> Receiver<LinkEvent>;

    /// Pulse the estimator reset flag: write `1`, hold for `pulse`, write `0`.
    fn reset_estimator(&mut self, pulse: Duration) -> Result<(), LinkError> {
        self.set_param(RESET_ESTIMATION_PARAM, "1")?;
        thread::sleep(pulse);
        self.set_param(RESET_ESTIMATION_PARAM, "0")
    }
}

/// Log link events until the sending side goes away.
///
/// Faults are reported here and never propagated across threads.
pub fn spawn_link_monitor(events: Receiver<LinkEvent>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("link-monitor".into())
        .spawn(move || {
            for event in events {
                log_event(&event);
            }
        })
}

fn log_event(event: &LinkEvent) {
    match event {
        LinkEvent::Connected { uri } => info!("Connected to {uri}"),
        LinkEvent::Disconnected { uri } => info!("Disconnected from {uri}"),
        LinkEvent::ConnectionFailed { uri, message } => {
            error!("Connection to {uri} failed: {message}")
        }
        LinkEvent::ConnectionLost { uri, message } => {
            error!("Connection to {uri} lost: {message}")
        }
        LinkEvent::LogError { group, message } => {
            warn!("Error when logging {group}: {message}")
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    setpoints: Vec<ControlOutput>,
    params: Vec<(String, String)>,
    telemetry: Option<(Duration, TelemetrySink)>,
    missing_variable: Option<String>,
    fail_sends: bool,
}

/// In-memory link that records everything sent to it.
///
/// Clones share state, so a test can keep one clone while the control loop
/// owns another.
#[derive(Debug, Clone)]
pub struct MockLink {
    uri: String,
    state: Arc<Mutex<MockState>>,
    events_tx: Sender<LinkEvent>,
    events_rx: Receiver<LinkEvent>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Create a connected mock link.
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        let link = Self {
            uri: "mock://0".to_string(),
            state: Arc::new(Mutex::new(MockState::default())),
            events_tx,
            events_rx,
        };
        link.set_connected(true);
        link
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Change the connection state and emit the matching event.
    pub fn set_connected(&self, connected: bool) {
        let was = std::mem::replace(&mut self.lock().connected, connected);
        let uri = self.uri.clone();
        let event = match (was, connected) {
            (false, true) => LinkEvent::Connected { uri },
            (true, false) => LinkEvent::ConnectionLost {
                uri,
                message: "mock link dropped".to_string(),
            },
            _ => return,
        };
        let _ = self.events_tx.send(event);
    }

    /// Make `start_telemetry` fail as if `name` were absent on the vehicle.
    pub fn set_missing_variable(&self, name: Option<&str>) {
        self.lock().missing_variable = name.map(str::to_string);
    }

    /// Make every `send_setpoint` fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Every setpoint sent so far.
    pub fn setpoints(&self) -> Vec<ControlOutput> {
        self.lock().setpoints.clone()
    }

    /// Every parameter write so far, in order.
    pub fn params(&self) -> Vec<(String, String)> {
        self.lock().params.clone()
    }

    /// Sink handed over by `start_telemetry`, for injecting samples.
    pub fn telemetry_sink(&self) -> Option<TelemetrySink> {
        self.lock().telemetry.as_ref().map(|(_, sink)| sink.clone())
    }

    /// Period requested by `start_telemetry`.
    pub fn telemetry_period(&self) -> Option<Duration> {
        self.lock().telemetry.as_ref().map(|(period, _)| *period)
    }
}

impl VehicleLink for MockLink {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn start_telemetry(&mut self, period: Duration, sink: TelemetrySink) -> Result<(), LinkError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if let Some(name) = &state.missing_variable {
            return Err(LinkError::MissingVariable(name.clone()));
        }
        state.telemetry = Some((period, sink));
        Ok(())
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.params.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send_setpoint(&mut self, setpoint: &ControlOutput) -> Result<(), LinkError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if state.fail_sends {
            return Err(LinkError::Rejected("mock send failure".to_string()));
        }
        state.setpoints.push(*setpoint);
        Ok(())
    }

    fn events(&self) -> Receiver<LinkEvent> {
        self.events_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::StateEstimateStore;

    #[test]
    fn test_reset_estimator_pulses_flag() {
        let mut link = MockLink::new();
        link.reset_estimator(Duration::from_millis(1)).unwrap();

        assert_eq!(
            link.params(),
            vec![
                (RESET_ESTIMATION_PARAM.to_string(), "1".to_string()),
                (RESET_ESTIMATION_PARAM.to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn test_disconnected_link_refuses_requests() {
        let mut link = MockLink::new();
        link.set_connected(false);

        assert!(matches!(
            link.send_setpoint(&ControlOutput::ZERO),
            Err(LinkError::NotConnected)
        ));
        assert!(matches!(
            link.set_param("a", "b"),
            Err(LinkError::NotConnected)
        ));
    }

    #[test]
    fn test_missing_variable_fails_telemetry_start() {
        let mut link = MockLink::new();
        link.set_missing_variable(Some("kalman.q0"));

        let err = link
            .start_telemetry(Duration::from_millis(20), StateEstimateStore::new().sink())
            .unwrap_err();
        assert!(matches!(err, LinkError::MissingVariable(name) if name == "kalman.q0"));
    }

    #[test]
    fn test_connection_events_emitted() {
        let link = MockLink::new();
        let events = link.events();
        link.set_connected(false);
        link.set_connected(true);

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], LinkEvent::Connected { .. }));
        assert!(matches!(received[1], LinkEvent::ConnectionLost { .. }));
        assert!(matches!(received[2], LinkEvent::Connected { .. }));
    }

    #[test]
    fn test_clones_share_recorded_setpoints() {
        let probe = MockLink::new();
        let mut link = probe.clone();
        link.send_setpoint(&ControlOutput::idle(100)).unwrap();
        assert_eq!(probe.setpoints(), vec![ControlOutput::idle(100)]);
    }
}
