//! Cascaded position control law.
//!
//! A pure function from (estimate, reference, integral, gains, armed) to a
//! clamped setpoint and the updated integral. Three channels:
//!
//! - **Height**: PID on the z error with mass compensation, scaled by the
//!   inverse tilt cosine so vertical force is held while banked:
//!   `T = 4·C·(kP·e_z − kD·v_z + m·g + kI·∫e_z) · 2¹⁶ / (cos φ · cos θ)`
//!   where φ, θ are the measured stabilizer roll and pitch.
//! - **Lateral**: PD on the x/y error in the world frame,
//!   `pitch = 20·(kP·e_x − kD·v_x)`, `roll = −20·(kP·e_y − kD·v_y)`, then
//!   rotated into the heading frame by the estimated yaw:
//!   `[pitch'; roll'] = R(ψ)·[pitch; roll]`.
//! - **Yaw**: PD producing a yaw-rate command, `−(kP·e_ψ − kD·ψ̇)`, with
//!   the error in degrees against the stabilizer yaw.
//!
//! # Tilt compensation floor
//!
//! The product `cos φ · cos θ` is floored at [`TILT_COMPENSATION_FLOOR`], so
//! past roughly 60° of combined tilt the compensation stops growing instead
//! of driving thrust toward infinity. Non-finite inputs are not masked: they
//! propagate into [`RawCommand`] where the control loop rejects them.

use nalgebra::{Rotation2, Vector2, Vector3};

use crate::config::{Bounds, ControllerConfig, OutputLimits, THRUST_FULL_SCALE};
use crate::estimate::StateEstimate;
use crate::setpoint::{ControlOutput, IntegralState, RawCommand, Reference};

/// Lower bound on the tilt cosine product used as the thrust divisor.
pub const TILT_COMPENSATION_FLOOR: f64 = 0.5;

/// Scale from the lateral PD term to a commanded angle in degrees.
const LATERAL_ANGLE_SCALE: f64 = 20.0;

/// Everything the control law reads for one tick.
#[derive(Debug, Clone, Copy)]
pub struct ControlInput<'a> {
    /// Estimate snapshot for this tick
    pub estimate: &'a StateEstimate,
    /// Reference for this tick
    pub reference: &'a Reference,
    /// Integral state carried from the previous tick
    pub integral: IntegralState,
    /// Gains and limits for this tick
    pub config: &'a ControllerConfig,
    /// Whether the integral should accumulate
    pub armed: bool,
}

/// Tracking errors computed along the way.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackingError {
    /// Reference minus estimated position, world frame (m)
    pub position: Vector3<f64>,
    /// Reference yaw minus stabilizer yaw (deg)
    pub yaw: f64,
    /// Euclidean norm of the position error (m)
    pub magnitude: f64,
}

/// Result of one evaluation of the control law.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlStep {
    /// Clamped setpoint ready for dispatch
    pub output: ControlOutput,
    /// Unclamped command
    pub raw: RawCommand,
    /// Integral state to carry into the next tick
    pub integral: IntegralState,
    /// Tracking errors for this tick
    pub error: TrackingError,
    /// True when the tilt compensation floor was hit
    pub tilt_saturated: bool,
}

impl ControlStep {
    /// True when the command is safe to send to the vehicle.
    pub fn is_dispatchable(&self) -> bool {
        self.raw.is_finite()
    }
}

/// Evaluate the control law.
pub fn compute(input: ControlInput<'_>) -> ControlStep {
    let ControlInput {
        estimate,
        reference,
        integral,
        config,
        armed,
    } = input;

    let (_, _, yaw) = estimate.euler();

    let e = reference.position - estimate.position;
    let e_yaw = reference.yaw_degrees() - estimate.stabilizer.z;
    let error = TrackingError {
        position: e,
        yaw: e_yaw,
        magnitude: e.norm(),
    };

    // Height channel
    let integral = if armed {
        integral.accumulate(e.z, config.integral_limit)
    } else {
        integral
    };
    let gains = &config.thrust;
    let force = gains.kp * e.z - gains.kd * estimate.velocity.z
        + config.weight()
        + gains.ki * integral.height;
    let tilt =
        estimate.stabilizer.x.to_radians().cos() * estimate.stabilizer.y.to_radians().cos();
    let tilt_saturated = tilt < TILT_COMPENSATION_FLOOR;
    let divisor = if tilt_saturated {
        TILT_COMPENSATION_FLOOR
    } else {
        tilt
    };
    let thrust = 4.0 * gains.c * force * THRUST_FULL_SCALE / divisor;

    // Lateral channel, world frame then heading frame
    let gains = &config.lateral;
    let world = Vector2::new(
        LATERAL_ANGLE_SCALE * (gains.kp * e.x - gains.kd * estimate.velocity.x),
        -LATERAL_ANGLE_SCALE * (gains.kp * e.y - gains.kd * estimate.velocity.y),
    );
    let heading = Rotation2::new(yaw) * world;

    // Yaw channel
    let gains = &config.yaw;
    let yaw_rate = -(gains.kp * e_yaw - gains.kd * estimate.yaw_rate);

    let raw = RawCommand {
        roll: heading.y,
        pitch: heading.x,
        yaw_rate,
        thrust,
    };

    ControlStep {
        output: clamp_output(&raw, &config.limits),
        raw,
        integral,
        error,
        tilt_saturated,
    }
}

/// Clamp every channel independently; thrust is additionally floored at 0.
pub fn clamp_output(raw: &RawCommand, limits: &OutputLimits) -> ControlOutput {
    let thrust_range = Bounds::new(limits.thrust.min.max(0.0), limits.thrust.max);
    let thrust = thrust_range.clamp(raw.thrust);
    ControlOutput {
        roll: limits.roll.clamp(raw.roll),
        pitch: limits.pitch.clamp(raw.pitch),
        yaw_rate: limits.yaw_rate.clamp(raw.yaw_rate),
        // In range by construction; NaN is caught on the raw command
        thrust: thrust as u16,
    }
}
