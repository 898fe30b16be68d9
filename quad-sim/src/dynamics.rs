//! Point-mass quadrotor model.
//!
//! Attitude follows the commanded roll and pitch through a first-order lag,
//! yaw integrates the yaw-rate command, and the collective thrust acts along
//! the body z axis. Drag is linear in velocity. The ground is a plane at
//! z = 0 that the vehicle cannot sink through.

use flight_control::config::THRUST_FULL_SCALE;
use flight_control::ControlOutput;
use nalgebra::{UnitQuaternion, Vector3};

/// Physical parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadParams {
    /// Mass (kg)
    pub mass: f64,
    /// Gravitational acceleration (m/s^2)
    pub gravity: f64,
    /// Force-to-command constant, matching the controller's `C`
    pub thrust_constant: f64,
    /// Roll/pitch response time constant (s)
    pub attitude_time_constant: f64,
    /// Linear drag coefficient (1/s)
    pub drag: f64,
}

impl Default for QuadParams {
    fn default() -> Self {
        Self {
            mass: 0.027,
            gravity: 9.81,
            thrust_constant: 0.5,
            attitude_time_constant: 0.08,
            drag: 0.2,
        }
    }
}

impl QuadParams {
    /// Thrust command that exactly balances gravity when level.
    pub fn hover_thrust(&self) -> f64 {
        4.0 * self.thrust_constant * self.mass * self.gravity * THRUST_FULL_SCALE
    }

    /// Force (N) produced by a thrust command.
    pub fn thrust_force(&self, thrust: u16) -> f64 {
        f64::from(thrust) / (4.0 * self.thrust_constant * THRUST_FULL_SCALE)
    }
}

/// True vehicle state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadState {
    /// World frame (m)
    pub position: Vector3<f64>,
    /// World frame (m/s)
    pub velocity: Vector3<f64>,
    /// Roll (deg)
    pub roll: f64,
    /// Pitch (deg)
    pub pitch: f64,
    /// Yaw (deg), wrapped into (-180, 180]
    pub yaw: f64,
    /// Yaw rate (deg/s)
    pub yaw_rate: f64,
}

impl QuadState {
    pub fn at(position: Vector3<f64>) -> Self {
        Self {
            position,
            velocity: Vector3::zeros(),
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
        }
    }

    /// Body-to-world attitude.
    pub fn attitude(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(
            self.roll.to_radians(),
            self.pitch.to_radians(),
            self.yaw.to_radians(),
        )
    }

    /// Velocity expressed in the body frame.
    pub fn body_velocity(&self) -> Vector3<f64> {
        self.attitude().inverse() * self.velocity
    }

    pub fn on_ground(&self) -> bool {
        self.position.z <= 0.0
    }
}

fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

/// The simulated vehicle.
///
/// Motors start locked, as on the real commander: setpoints are ignored until
/// one with zero thrust arrives.
#[derive(Debug, Clone)]
pub struct QuadModel {
    params: QuadParams,
    state: QuadState,
    command: ControlOutput,
    motors_locked: bool,
}

impl QuadModel {
    pub fn new(params: QuadParams, state: QuadState) -> Self {
        Self {
            params,
            state,
            command: ControlOutput::ZERO,
            motors_locked: true,
        }
    }

    pub fn params(&self) -> &QuadParams {
        &self.params
    }

    pub fn state(&self) -> &QuadState {
        &self.state
    }

    pub fn command(&self) -> &ControlOutput {
        &self.command
    }

    pub fn motors_locked(&self) -> bool {
        self.motors_locked
    }

    /// Accept a setpoint from the link.
    pub fn apply_setpoint(&mut self, setpoint: &ControlOutput) {
        if self.motors_locked {
            if setpoint.thrust == 0 {
                self.motors_locked = false;
            }
            return;
        }
        self.command = *setpoint;
    }

    /// Advance the model by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let p = self.params;
        let cmd = self.command;
        let s = &mut self.state;

        let alpha = dt / (p.attitude_time_constant + dt);
        s.roll += alpha * (cmd.roll - s.roll);
        s.pitch += alpha * (cmd.pitch - s.pitch);

        // The commander treats a positive yaw-rate command as clockwise
        s.yaw_rate = -cmd.yaw_rate;
        s.yaw = wrap_degrees(s.yaw + s.yaw_rate * dt);

        let force = if self.motors_locked {
            0.0
        } else {
            p.thrust_force(cmd.thrust)
        };
        let thrust = s.attitude() * Vector3::new(0.0, 0.0, force / p.mass);
        let accel = thrust - Vector3::new(0.0, 0.0, p.gravity) - p.drag * s.velocity;

        s.velocity += accel * dt;
        s.position += s.velocity * dt;

        if s.position.z <= 0.0 {
            s.position.z = 0.0;
            if s.velocity.z < 0.0 {
                s.velocity = Vector3::zeros();
            }
        }
    }
}
