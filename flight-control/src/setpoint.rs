//! Reference and command types exchanged around the control law.

use nalgebra::Vector3;

use crate::config::Bounds;

/// Desired position and heading the controller steers toward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reference {
    /// Position in the world frame (m)
    pub position: Vector3<f64>,
    /// Heading (rad)
    pub yaw: f64,
}

impl Default for Reference {
    fn default() -> Self {
        Self {
            position: Vector3::new(0.0, 0.0, 1.0),
            yaw: 0.0,
        }
    }
}

impl Reference {
    /// Create a reference from coordinates and a yaw in radians.
    pub fn new(x: f64, y: f64, z: f64, yaw: f64) -> Self {
        Self {
            position: Vector3::new(x, y, z),
            yaw,
        }
    }

    /// Yaw in degrees.
    pub fn yaw_degrees(&self) -> f64 {
        self.yaw.to_degrees()
    }
}

/// Setpoint dispatched to the vehicle each armed tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlOutput {
    /// Roll angle (deg)
    pub roll: f64,
    /// Pitch angle (deg)
    pub pitch: f64,
    /// Yaw rate (deg/s)
    pub yaw_rate: f64,
    /// Thrust in device units
    pub thrust: u16,
}

impl ControlOutput {
    /// All-zero setpoint. Also unlocks the vehicle's commander.
    pub const ZERO: ControlOutput = ControlOutput {
        roll: 0.0,
        pitch: 0.0,
        yaw_rate: 0.0,
        thrust: 0,
    };

    /// Level attitude at the given thrust.
    pub fn idle(thrust: u16) -> Self {
        Self {
            thrust,
            ..Self::ZERO
        }
    }

    /// True when every angle channel is finite.
    pub fn is_finite(&self) -> bool {
        self.roll.is_finite() && self.pitch.is_finite() && self.yaw_rate.is_finite()
    }
}

/// Control law output before clamping, thrust still in floating point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawCommand {
    /// Roll angle (deg)
    pub roll: f64,
    /// Pitch angle (deg)
    pub pitch: f64,
    /// Yaw rate (deg/s)
    pub yaw_rate: f64,
    /// Thrust in device units
    pub thrust: f64,
}

impl RawCommand {
    /// True when every channel is finite.
    pub fn is_finite(&self) -> bool {
        self.roll.is_finite()
            && self.pitch.is_finite()
            && self.yaw_rate.is_finite()
            && self.thrust.is_finite()
    }
}

/// Accumulated height error.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntegralState {
    /// Sum of per-tick height errors (m), clamped
    pub height: f64,
}

impl IntegralState {
    /// Zero accumulator.
    pub const ZERO: IntegralState = IntegralState { height: 0.0 };

    /// Add one tick of height error and clamp into `limit`.
    pub fn accumulate(self, height_error: f64, limit: Bounds) -> Self {
        Self {
            height: limit.clamp(self.height + height_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_is_bounded() {
        let limit = Bounds::symmetric(200.0);
        let mut integral = IntegralState::ZERO;
        for _ in 0..10_000 {
            integral = integral.accumulate(3.7, limit);
            assert!(integral.height <= 200.0);
        }
        assert_eq!(integral.height, 200.0);

        for _ in 0..10_000 {
            integral = integral.accumulate(-5.0, limit);
            assert!(integral.height >= -200.0);
        }
        assert_eq!(integral.height, -200.0);
    }

    #[test]
    fn test_idle_output() {
        let idle = ControlOutput::idle(1200);
        assert_eq!(idle.thrust, 1200);
        assert_eq!((idle.roll, idle.pitch, idle.yaw_rate), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_reference_yaw_degrees() {
        let r = Reference::new(0.0, 0.0, 1.0, std::f64::consts::PI);
        assert!((r.yaw_degrees() - 180.0).abs() < 1e-12);
    }
}
