//! Latest state estimate, written by telemetry delivery and read by the control loop.
//!
//! # Telemetry groups
//!
//! The vehicle streams its estimator output as four independent groups, each
//! on its own schedule. Delivery order across groups is not synchronized, so
//! the store keeps the latest value of every group and hands the control loop
//! one consistent copy of all of them per tick.
//!
//! | Group      | Variables                                             |
//! |------------|-------------------------------------------------------|
//! | Stabilizer | `stabilizer.roll`, `stabilizer.pitch`, `stabilizer.yaw` (deg) |
//! | Position   | `kalman.stateX`, `kalman.stateY`, `kalman.stateZ` (m) |
//! | Velocity   | `kalman.statePX/PY/PZ` (body frame, m/s), `gyro.z` (deg/s) |
//! | Attitude   | `kalman.q0` (scalar), `kalman.q1`, `kalman.q2`, `kalman.q3` |
//!
//! # Quaternion convention
//!
//! The wire format is scalar-first (`q0` is the real part). The store keeps a
//! [`UnitQuaternion`], renormalized on ingestion. The rotation matrix is always
//! derived from it, never stored on its own.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nalgebra::{Quaternion, Rotation3, UnitQuaternion, Vector3};
use tracing::warn;

/// Telemetry variable groups delivered by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryGroup {
    /// On-board stabilizer attitude in degrees
    Stabilizer,
    /// Estimated position in the world frame
    Position,
    /// Estimated body-frame velocity and measured yaw rate
    Velocity,
    /// Estimated attitude quaternion
    Attitude,
}

impl TelemetryGroup {
    /// Every group, in index order.
    pub const ALL: [TelemetryGroup; 4] = [
        TelemetryGroup::Stabilizer,
        TelemetryGroup::Position,
        TelemetryGroup::Velocity,
        TelemetryGroup::Attitude,
    ];

    /// Human readable name of the group.
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryGroup::Stabilizer => "Stabilizer",
            TelemetryGroup::Position => "Kalman Position",
            TelemetryGroup::Velocity => "Kalman Velocity",
            TelemetryGroup::Attitude => "Kalman Attitude",
        }
    }

    /// Telemetry variables the group subscribes to.
    pub fn variables(&self) -> &'static [&'static str] {
        match self {
            TelemetryGroup::Stabilizer => {
                &["stabilizer.roll", "stabilizer.pitch", "stabilizer.yaw"]
            }
            TelemetryGroup::Position => &["kalman.stateX", "kalman.stateY", "kalman.stateZ"],
            TelemetryGroup::Velocity => &[
                "kalman.statePX",
                "kalman.statePY",
                "kalman.statePZ",
                "gyro.z",
            ],
            TelemetryGroup::Attitude => &["kalman.q0", "kalman.q1", "kalman.q2", "kalman.q3"],
        }
    }

    fn index(&self) -> usize {
        match self {
            TelemetryGroup::Stabilizer => 0,
            TelemetryGroup::Position => 1,
            TelemetryGroup::Velocity => 2,
            TelemetryGroup::Attitude => 3,
        }
    }
}

impl std::fmt::Display for TelemetryGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One delivery of a telemetry group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetrySample {
    /// Stabilizer roll, pitch, yaw in degrees
    Stabilizer { roll: f64, pitch: f64, yaw: f64 },
    /// World-frame position in meters
    Position { x: f64, y: f64, z: f64 },
    /// Body-frame velocity (m/s) and gyro z rate (deg/s)
    Velocity { body: Vector3<f64>, yaw_rate: f64 },
    /// Attitude quaternion, `q0` is the scalar part
    Attitude { q0: f64, q1: f64, q2: f64, q3: f64 },
}

impl TelemetrySample {
    /// The group this sample belongs to.
    pub fn group(&self) -> TelemetryGroup {
        match self {
            TelemetrySample::Stabilizer { .. } => TelemetryGroup::Stabilizer,
            TelemetrySample::Position { .. } => TelemetryGroup::Position,
            TelemetrySample::Velocity { .. } => TelemetryGroup::Velocity,
            TelemetrySample::Attitude { .. } => TelemetryGroup::Attitude,
        }
    }
}

/// Point-in-time copy of every estimate field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateEstimate {
    /// Position in the world frame (m)
    pub position: Vector3<f64>,
    /// Velocity in the world frame (m/s)
    pub velocity: Vector3<f64>,
    /// Attitude, body to world
    pub attitude: UnitQuaternion<f64>,
    /// Stabilizer roll, pitch, yaw (deg)
    pub stabilizer: Vector3<f64>,
    /// Measured yaw rate (deg/s)
    pub yaw_rate: f64,
}

impl Default for StateEstimate {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            stabilizer: Vector3::zeros(),
            yaw_rate: 0.0,
        }
    }
}

impl StateEstimate {
    /// Rotation matrix derived from the attitude quaternion.
    pub fn rotation(&self) -> Rotation3<f64> {
        self.attitude.to_rotation_matrix()
    }

    /// Roll, pitch, yaw (rad) decomposed from the attitude quaternion.
    pub fn euler(&self) -> (f64, f64, f64) {
        self.attitude.euler_angles()
    }

    /// Fold one telemetry sample into the estimate.
    ///
    /// Returns false, leaving the estimate untouched, when the sample carries
    /// a quaternion that cannot be normalized.
    pub fn apply(&mut self, sample: &TelemetrySample) -> bool {
        match *sample {
            TelemetrySample::Stabilizer { roll, pitch, yaw } => {
                self.stabilizer = Vector3::new(roll, pitch, yaw);
            }
            TelemetrySample::Position { x, y, z } => {
                self.position = Vector3::new(x, y, z);
            }
            TelemetrySample::Velocity { body, yaw_rate } => {
                self.velocity = self.attitude * body;
                self.yaw_rate = yaw_rate;
            }
            TelemetrySample::Attitude { q0, q1, q2, q3 } => {
                let q = Quaternion::new(q0, q1, q2, q3);
                if !q.coords.iter().all(|c| c.is_finite()) {
                    return false;
                }
                match UnitQuaternion::try_new(q, 1e-9) {
                    Some(unit) => self.attitude = unit,
                    None => return false,
                }
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    estimate: StateEstimate,
    last_update: [Option<Instant>; 4],
    updates: u64,
    rejected: u64,
}

/// Holds the latest state estimate.
///
/// A single lock guards the whole estimate, so a snapshot never mixes fields
/// from the middle of an update. Critical sections are a struct copy, so
/// writers never wait on anything slower than another copy.
#[derive(Debug, Clone, Default)]
pub struct StateEstimateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl StateEstimateStore {
    /// Create an empty store holding the default (origin, level) estimate.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Overwrite the fields carried by `sample`.
    pub fn update(&self, sample: TelemetrySample) {
        let group = sample.group();
        let mut inner = self.lock();
        if inner.estimate.apply(&sample) {
            inner.last_update[group.index()] = Some(Instant::now());
            inner.updates += 1;
        } else {
            inner.rejected += 1;
            drop(inner);
            warn!("Dropping degenerate {group} sample: {sample:?}");
        }
    }

    /// Consistent copy of every field.
    pub fn snapshot(&self) -> StateEstimate {
        self.lock().estimate
    }

    /// Write-side handle for telemetry delivery threads.
    pub fn sink(&self) -> TelemetrySink {
        TelemetrySink {
            store: self.clone(),
        }
    }

    /// Groups that have never been delivered.
    pub fn missing_groups(&self) -> Vec<TelemetryGroup> {
        let inner = self.lock();
        TelemetryGroup::ALL
            .into_iter()
            .filter(|g| inner.last_update[g.index()].is_none())
            .collect()
    }

    /// Time since `group` was last delivered, if ever.
    pub fn age(&self, group: TelemetryGroup) -> Option<Duration> {
        self.lock().last_update[group.index()].map(|t| t.elapsed())
    }

    /// Number of samples accepted so far.
    pub fn update_count(&self) -> u64 {
        self.lock().updates
    }

    /// Number of samples dropped as degenerate.
    pub fn rejected_count(&self) -> u64 {
        self.lock().rejected
    }
}

/// Cloneable write side of a [`StateEstimateStore`].
///
/// Handed to the vehicle link so its delivery threads can publish samples
/// without access to the read side.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    store: StateEstimateStore,
}

impl TelemetrySink {
    /// Publish one sample.
    pub fn deliver(&self, sample: TelemetrySample) {
        self.store.update(sample);
    }
}
