//! Position sanity check against the operating envelope.
//!
//! The check exists to catch estimator divergence. A violation is never
//! clamped away: startup aborts, and an armed session disarms.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A position estimate the controller refuses to fly on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyError {
    /// The estimate lies outside the operating envelope.
    #[error(
        "Position estimate out of bounds: ({:.3}, {:.3}, {:.3})",
        .position.x,
        .position.y,
        .position.z
    )]
    OutOfBounds {
        /// Offending position in the world frame (m)
        position: Vector3<f64>,
    },

    /// The estimate contains NaN or infinite components.
    #[error("Position estimate is not finite: ({}, {}, {})", .position.x, .position.y, .position.z)]
    NonFinite {
        /// Offending position in the world frame (m)
        position: Vector3<f64>,
    },
}

/// Box the position estimate must stay inside.
///
/// Horizontal limit applies to |x| and |y| independently; the vertical
/// range is `[floor, ceiling]`. Points on the boundary are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyEnvelope {
    /// Maximum |x| and |y| from the origin (m)
    pub horizontal: f64,
    /// Lowest allowed z (m)
    pub floor: f64,
    /// Highest allowed z (m)
    pub ceiling: f64,
}

impl Default for SafetyEnvelope {
    fn default() -> Self {
        Self {
            horizontal: 20.0,
            floor: 0.0,
            ceiling: 5.0,
        }
    }
}

impl SafetyEnvelope {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.horizontal.is_finite() && self.floor.is_finite() && self.ceiling.is_finite()) {
            return Err("limits must be finite".to_string());
        }
        if self.horizontal <= 0.0 {
            return Err(format!("horizontal must be positive, got {}", self.horizontal));
        }
        if self.floor > self.ceiling {
            return Err(format!(
                "floor {} is above ceiling {}",
                self.floor, self.ceiling
            ));
        }
        Ok(())
    }
}

/// Validates state estimates against a [`SafetyEnvelope`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyMonitor {
    envelope: SafetyEnvelope,
}

impl SafetyMonitor {
    /// Create a monitor for the given envelope.
    pub fn new(envelope: SafetyEnvelope) -> Self {
        Self { envelope }
    }

    /// The envelope this monitor enforces.
    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    /// Check a world-frame position.
    pub fn check(&self, position: &Vector3<f64>) -> Result<(), SafetyError> {
        if !position.iter().all(|v| v.is_finite()) {
            return Err(SafetyError::NonFinite {
                position: *position,
            });
        }

        let env = &self.envelope;
        let horizontal = position.x.abs().max(position.y.abs());
        if horizontal > env.horizontal || position.z < env.floor || position.z > env.ceiling {
            return Err(SafetyError::OutOfBounds {
                position: *position,
            });
        }

        Ok(())
    }
}
