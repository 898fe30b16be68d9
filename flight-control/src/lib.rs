//! Closed-loop position control for a small quadrotor.
//!
//! This crate turns a continuously updated state estimate and a mutable
//! reference into roll, pitch, yaw-rate and thrust setpoints at a fixed rate.
//!
//! # Modules
//!
//! - [`estimate`] - latest state estimate, written by telemetry threads
//! - [`control_law`] - cascaded PID law (height, lateral, yaw rate)
//! - [`safety`] - position sanity check against the operating envelope
//! - [`control_loop`] - fixed-period loop, arm/disarm state machine, handle
//! - [`waypoints`] - waypoint plans and the sequencer that flies them
//! - [`config`] - JSON configuration and hot reload
//! - [`link`] - seam to the radio link and telemetry transport
//! - [`flight_log`] - per-session CSV log
//! - [`input`] - operator key map

pub mod config;
pub mod control_law;
pub mod control_loop;
pub mod estimate;
pub mod flight_log;
pub mod input;
pub mod link;
pub mod safety;
pub mod setpoint;
pub mod waypoints;

pub use config::{ConfigError, ConfigHandle, ConfigReloader, ControllerConfig};
pub use control_loop::{
    ControlError, ControlHandle, ControlLoop, LoopPhase, LoopSettings, LoopStatus,
};
pub use estimate::{
    StateEstimate, StateEstimateStore, TelemetryGroup, TelemetrySample, TelemetrySink,
};
pub use flight_log::{FlightLog, FlightLogError};
pub use link::{LinkError, LinkEvent, VehicleLink};
pub use safety::{SafetyEnvelope, SafetyError, SafetyMonitor};
pub use setpoint::{ControlOutput, Reference};
pub use waypoints::{SequenceError, WaypointPlan, WaypointSequencer};
