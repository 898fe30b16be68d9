//! Waypoint plans and the sequencer that flies them.
//!
//! A [`WaypointPlan`] is stored in the configuration as parallel coordinate
//! columns. The [`WaypointSequencer`] hands waypoints to the control loop one
//! at a time: it writes the reference, waits until the loop reports an error
//! magnitude below the margin for that reference, holds for a settle delay,
//! then moves on. Disarming at any point aborts the plan.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigHandle, ControllerConfig};
use crate::control_loop::{ControlHandle, LoopPhase, LoopStatus};
use crate::setpoint::Reference;

/// One target pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    /// x (m), absolute or relative to the initial reference
    pub x: f64,
    /// y (m), absolute or relative to the initial reference
    pub y: f64,
    /// Altitude (m), always absolute
    pub z: f64,
    /// Heading (deg), always absolute
    pub yaw_deg: f64,
}

/// On-disk column layout of a waypoint plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CoordinateColumns {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    yaw: Vec<f64>,
    #[serde(default)]
    relative: bool,
}

/// Ordered waypoints plus the sequence-wide relative flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CoordinateColumns", into = "CoordinateColumns")]
pub struct WaypointPlan {
    pub waypoints: Vec<Waypoint>,
    /// When set, x and y are offsets from the initial reference
    pub relative: bool,
}

impl TryFrom<CoordinateColumns> for WaypointPlan {
    type Error = String;

    fn try_from(columns: CoordinateColumns) -> Result<Self, Self::Error> {
        let n = columns.x.len();
        if columns.y.len() != n || columns.z.len() != n || columns.yaw.len() != n {
            return Err(format!(
                "coordinate columns differ in length: x={}, y={}, z={}, yaw={}",
                n,
                columns.y.len(),
                columns.z.len(),
                columns.yaw.len()
            ));
        }

        let waypoints = (0..n)
            .map(|i| Waypoint {
                x: columns.x[i],
                y: columns.y[i],
                z: columns.z[i],
                yaw_deg: columns.yaw[i],
            })
            .collect();

        Ok(Self {
            waypoints,
            relative: columns.relative,
        })
    }
}

impl From<WaypointPlan> for CoordinateColumns {
    fn from(plan: WaypointPlan) -> Self {
        let mut columns = CoordinateColumns {
            relative: plan.relative,
            ..Default::default()
        };
        for wp in plan.waypoints {
            columns.x.push(wp.x);
            columns.y.push(wp.y);
            columns.z.push(wp.z);
            columns.yaw.push(wp.yaw_deg);
        }
        columns
    }
}

impl WaypointPlan {
    pub fn new(waypoints: Vec<Waypoint>, relative: bool) -> Self {
        Self {
            waypoints,
            relative,
        }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Absolute reference for waypoint `index`, if the plan has one.
    ///
    /// Only x and y are offset by `initial` in a relative plan; altitude and
    /// heading are always taken as given.
    pub fn reference(&self, index: usize, initial: &Reference) -> Option<Reference> {
        let (dx, dy) = if self.relative {
            (initial.position.x, initial.position.y)
        } else {
            (0.0, 0.0)
        };
        self.waypoints
            .get(index)
            .map(|wp| Reference::new(wp.x + dx, wp.y + dy, wp.z, wp.yaw_deg.to_radians()))
    }

    /// Absolute references for every waypoint.
    pub fn resolve(&self, initial: &Reference) -> Vec<Reference> {
        (0..self.len())
            .filter_map(|i| self.reference(i, initial))
            .collect()
    }
}

/// Ways a sequence can end early.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequenceError {
    /// The controller was never armed.
    #[error("Controller not armed within {0:?}")]
    ArmTimeout(Duration),

    /// The controller was disarmed while flying the plan.
    #[error("Disarmed while flying to waypoint {index}")]
    Interrupted { index: usize },

    /// The control loop exited.
    #[error("Control loop stopped")]
    LoopStopped,
}

/// What the sequencer needs from the control loop.
pub trait ReferenceControl {
    /// Replace the reference, returning its generation.
    fn set_reference(&self, reference: Reference) -> u64;

    /// Request disarm.
    fn disable(&self);

    /// Latest loop status.
    fn status(&self) -> LoopStatus;

    /// Block until armed or `timeout` elapses.
    fn wait_until_armed(&self, timeout: Duration) -> bool;
}

impl ReferenceControl for ControlHandle {
    fn set_reference(&self, reference: Reference) -> u64 {
        ControlHandle::set_reference(self, reference)
    }

    fn disable(&self) {
        ControlHandle::disable(self)
    }

    fn status(&self) -> LoopStatus {
        ControlHandle::status(self)
    }

    fn wait_until_armed(&self, timeout: Duration) -> bool {
        ControlHandle::wait_until_armed(self, timeout)
    }
}

/// Sequencer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// No waypoint dispatched yet
    Idle,
    /// Reference written, waiting for the error to drop below the margin
    Approaching { index: usize, generation: u64 },
    /// Margin reached, holding before advancing
    Settling { index: usize, since: Instant },
    /// Every waypoint reached and the controller disarmed
    Finished,
    /// Disarmed before the plan completed
    Aborted { index: usize },
}

/// Sequencer timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequencerSettings {
    /// Interval between convergence checks
    pub poll_interval: Duration,
    /// Hold time after reaching a waypoint
    pub settle_delay: Duration,
    /// How long [`WaypointSequencer::run`] waits for the operator to arm
    pub arm_timeout: Duration,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(500),
            arm_timeout: Duration::from_secs(300),
        }
    }
}

/// Steps through the waypoints of the live configuration.
///
/// Each waypoint is resolved against the initial reference only when it is
/// dispatched, so edits to upcoming waypoints take effect mid-plan.
#[derive(Debug, Clone)]
pub struct WaypointSequencer {
    initial: Reference,
    settings: SequencerSettings,
    state: SequencerState,
}

impl WaypointSequencer {
    /// `initial` anchors relative plans, normally the reference seeded at
    /// startup.
    pub fn new(initial: Reference, settings: SequencerSettings) -> Self {
        Self {
            initial,
            settings,
            state: SequencerState::Idle,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn initial(&self) -> &Reference {
        &self.initial
    }

    fn dispatch<C: ReferenceControl>(
        &self,
        index: usize,
        control: &C,
        plan: &WaypointPlan,
    ) -> SequencerState {
        let Some(reference) = plan.reference(index, &self.initial) else {
            return self.finish(control);
        };
        info!(
            "Setting reference {}/{}: ({:.2}, {:.2}, {:.2}, {:.1}°)",
            index + 1,
            plan.len(),
            reference.position.x,
            reference.position.y,
            reference.position.z,
            reference.yaw_degrees()
        );
        let generation = control.set_reference(reference);
        SequencerState::Approaching { index, generation }
    }

    fn finish<C: ReferenceControl>(&self, control: &C) -> SequencerState {
        info!("Waypoint plan complete, disabling controller");
        control.disable();
        SequencerState::Finished
    }

    /// Advance the state machine by one poll against a configuration
    /// snapshot.
    ///
    /// Only dispatches the first waypoint while armed. A waypoint counts as
    /// reached when the loop reports an error magnitude strictly below the
    /// configured margin, computed against that waypoint's reference
    /// generation or a later one.
    pub fn step<C: ReferenceControl>(
        &mut self,
        now: Instant,
        control: &C,
        config: &ControllerConfig,
    ) -> SequencerState {
        let status = control.status();
        let plan = &config.waypoints;

        self.state = match self.state {
            SequencerState::Finished | SequencerState::Aborted { .. } => self.state,
            SequencerState::Idle if !status.armed => SequencerState::Idle,
            SequencerState::Idle => self.dispatch(0, control, plan),
            SequencerState::Approaching { index, .. } | SequencerState::Settling { index, .. }
                if !status.armed =>
            {
                warn!("Controller disarmed at waypoint {}", index + 1);
                SequencerState::Aborted { index }
            }
            SequencerState::Approaching { index, generation } => {
                if status.reference_generation >= generation
                    && status.error_magnitude < config.waypoint_margin
                {
                    debug!(
                        "Waypoint {} reached (error {:.3} m)",
                        index + 1,
                        status.error_magnitude
                    );
                    SequencerState::Settling { index, since: now }
                } else {
                    self.state
                }
            }
            SequencerState::Settling { index, since } => {
                if now.saturating_duration_since(since) < self.settings.settle_delay {
                    self.state
                } else {
                    self.dispatch(index + 1, control, plan)
                }
            }
        };

        self.state
    }

    /// Wait for the operator to arm, then fly the whole plan.
    ///
    /// The configuration is snapshotted on every poll, so a reload of the
    /// margin or of upcoming waypoints takes effect mid-plan.
    pub fn run<C: ReferenceControl>(
        &mut self,
        control: &C,
        config: &ConfigHandle,
    ) -> Result<(), SequenceError> {
        if !control.wait_until_armed(self.settings.arm_timeout) {
            if control.status().phase == LoopPhase::Stopped {
                return Err(SequenceError::LoopStopped);
            }
            return Err(SequenceError::ArmTimeout(self.settings.arm_timeout));
        }

        loop {
            if control.status().phase == LoopPhase::Stopped {
                return Err(SequenceError::LoopStopped);
            }

            match self.step(Instant::now(), control, &config.snapshot()) {
                SequencerState::Finished => return Ok(()),
                SequencerState::Aborted { index } => {
                    return Err(SequenceError::Interrupted { index })
                }
                _ => thread::sleep(self.settings.poll_interval),
            }
        }
    }
}
