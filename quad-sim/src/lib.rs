//! Simulated quadrotor for exercising the flight controller without hardware.
//!
//! [`SimLink`] implements [`flight_control::VehicleLink`] on top of a
//! point-mass [`QuadModel`] stepped in real time on its own thread.

pub mod dynamics;
pub mod link;

pub use dynamics::{QuadModel, QuadParams, QuadState};
pub use link::{SimError, SimLink, SimProbe, SimSettings};
