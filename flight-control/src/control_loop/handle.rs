//! Cross-thread access to a running control loop.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use nalgebra::Vector3;
use thiserror::Error;
use tracing::debug;

use crate::link::LinkError;
use crate::safety::SafetyError;
use crate::setpoint::{RawCommand, Reference};

/// Intents applied by the loop at the start of its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Arm the controller
    Enable,
    /// Disarm the controller
    Disable,
    /// Raise the idle thrust by one step
    IncreaseThrust,
    /// Lower the idle thrust by one step
    DecreaseThrust,
    /// Disarm and leave the loop
    Shutdown,
}

/// Why the loop last refused to arm or dropped out of the armed state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Fault {
    /// The position estimate failed the sanity check.
    #[error("{0}")]
    Safety(#[from] SafetyError),

    /// The control law produced a non-finite command.
    #[error("Non-finite control output: {0:?}")]
    NonFiniteOutput(RawCommand),

    /// The link refused a setpoint.
    #[error("Link fault: {0}")]
    Link(String),
}

impl From<LinkError> for Fault {
    fn from(err: LinkError) -> Self {
        Fault::Link(err.to_string())
    }
}

/// Lifecycle of the loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    /// Startup sequence in progress
    #[default]
    Starting,
    /// Ticking
    Running,
    /// The loop has exited
    Stopped,
}

/// Snapshot of the loop's externally visible state.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub phase: LoopPhase,
    pub armed: bool,
    /// Norm of the position error on the latest tick (m)
    pub error_magnitude: f64,
    /// Reference generation `error_magnitude` was computed against
    pub reference_generation: u64,
    /// Thrust currently commanded, or the idle trim while disarmed
    pub thrust: u16,
    pub tick_count: u64,
    pub deadline_misses: u64,
    pub last_fault: Option<Fault>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            phase: LoopPhase::Starting,
            armed: false,
            error_magnitude: f64::INFINITY,
            reference_generation: 0,
            thrust: 0,
            tick_count: 0,
            deadline_misses: 0,
            last_fault: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReferenceSlot {
    reference: Reference,
    generation: u64,
}

#[derive(Debug, Default)]
struct Shared {
    reference: Mutex<ReferenceSlot>,
    initial: Mutex<Option<Reference>>,
    status: Mutex<LoopStatus>,
    status_changed: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cloneable handle for arming, trimming and steering a control loop from
/// other threads.
///
/// Arm/disarm and trim requests are queued and take effect on the loop's next
/// tick. Reference writes land in a shared slot read once per tick; every
/// write bumps a generation counter so readers of [`LoopStatus`] can tell
/// which reference an error magnitude belongs to.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: Sender<Command>,
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub(crate) fn new() -> (Self, Receiver<Command>) {
        let (commands, receiver) = unbounded();
        let handle = Self {
            commands,
            shared: Arc::new(Shared::default()),
        };
        (handle, receiver)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Control loop gone, dropping {command:?}");
        }
    }

    /// Request arming. Refused by the loop if the estimate is out of bounds.
    pub fn enable(&self) {
        self.send(Command::Enable);
    }

    /// Request disarming. Always honoured on the next tick.
    pub fn disable(&self) {
        self.send(Command::Disable);
    }

    /// Raise the idle thrust trim by one step.
    pub fn increase_thrust(&self) {
        self.send(Command::IncreaseThrust);
    }

    /// Lower the idle thrust trim by one step.
    pub fn decrease_thrust(&self) {
        self.send(Command::DecreaseThrust);
    }

    /// Disarm and stop the loop.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    /// Replace the reference. Returns the new generation.
    pub fn set_reference(&self, reference: Reference) -> u64 {
        self.update_reference(|r| *r = reference)
    }

    /// Edit the reference in place. Returns the new generation.
    pub fn update_reference(&self, edit: impl FnOnce(&mut Reference)) -> u64 {
        let mut slot = lock(&self.shared.reference);
        edit(&mut slot.reference);
        slot.generation += 1;
        slot.generation
    }

    /// Shift the reference position by `offset` (m) and its yaw by
    /// `yaw_offset` (rad).
    pub fn nudge_reference(&self, offset: Vector3<f64>, yaw_offset: f64) -> u64 {
        self.update_reference(|r| {
            r.position += offset;
            r.yaw += yaw_offset;
        })
    }

    /// The current reference.
    pub fn reference(&self) -> Reference {
        lock(&self.shared.reference).reference
    }

    pub(crate) fn reference_with_generation(&self) -> (Reference, u64) {
        let slot = lock(&self.shared.reference);
        (slot.reference, slot.generation)
    }

    /// The reference seeded at startup, once startup has completed.
    pub fn initial_reference(&self) -> Option<Reference> {
        *lock(&self.shared.initial)
    }

    pub(crate) fn seed_reference(&self, reference: Reference) {
        *lock(&self.shared.initial) = Some(reference);
        self.set_reference(reference);
    }

    /// Latest loop status.
    pub fn status(&self) -> LoopStatus {
        lock(&self.shared.status).clone()
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.shared.status).armed
    }

    pub(crate) fn update_status(&self, edit: impl FnOnce(&mut LoopStatus)) {
        let mut status = lock(&self.shared.status);
        edit(&mut status);
        self.shared.status_changed.notify_all();
    }

    /// Block until the loop is armed, it stops, or `timeout` elapses.
    /// Returns whether the loop is armed.
    pub fn wait_until_armed(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| s.armed || s.phase == LoopPhase::Stopped)
            .armed
    }

    /// Block until the loop has left the startup phase or `timeout` elapses.
    pub fn wait_until_started(&self, timeout: Duration) -> LoopPhase {
        self.wait_for(timeout, |s| s.phase != LoopPhase::Starting)
            .phase
    }

    fn wait_for(&self, timeout: Duration, done: impl Fn(&LoopStatus) -> bool) -> LoopStatus {
        let deadline = Instant::now() + timeout;
        let mut status = lock(&self.shared.status);
        while !done(&status) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            status = match self.shared.status_changed.wait_timeout(status, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reference_writes_bump_generation() {
        let (handle, _rx) = ControlHandle::new();
        assert_eq!(handle.reference_with_generation().1, 0);

        let g1 = handle.set_reference(Reference::new(1.0, 2.0, 1.0, 0.0));
        let g2 = handle.nudge_reference(Vector3::new(0.1, 0.0, -0.5), 0.2);
        assert!(g2 > g1);

        let (reference, generation) = handle.reference_with_generation();
        assert_eq!(generation, g2);
        assert!((reference.position.x - 1.1).abs() < 1e-12);
        assert!((reference.position.z - 0.5).abs() < 1e-12);
        assert!((reference.yaw - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_commands_are_queued_in_order() {
        let (handle, rx) = ControlHandle::new();
        handle.enable();
        handle.increase_thrust();
        handle.disable();
        handle.shutdown();

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                Command::Enable,
                Command::IncreaseThrust,
                Command::Disable,
                Command::Shutdown
            ]
        );
    }

    #[test]
    fn test_send_after_loop_gone_is_harmless() {
        let (handle, rx) = ControlHandle::new();
        drop(rx);
        handle.enable();
    }

    #[test]
    fn test_wait_until_armed_times_out() {
        let (handle, _rx) = ControlHandle::new();
        let start = Instant::now();
        assert!(!handle.wait_until_armed(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_until_armed_wakes_on_arm() {
        let (handle, _rx) = ControlHandle::new();
        let arming = handle.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            arming.update_status(|s| s.armed = true);
        });

        assert!(handle.wait_until_armed(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_until_armed_returns_when_stopped() {
        let (handle, _rx) = ControlHandle::new();
        handle.update_status(|s| s.phase = LoopPhase::Stopped);

        let start = Instant::now();
        assert!(!handle.wait_until_armed(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_seed_sets_initial_and_current() {
        let (handle, _rx) = ControlHandle::new();
        assert!(handle.initial_reference().is_none());

        let seed = Reference::new(0.3, -0.2, 1.0, 0.0);
        handle.seed_reference(seed);
        handle.nudge_reference(Vector3::new(1.0, 0.0, 0.0), 0.0);

        assert_eq!(handle.initial_reference(), Some(seed));
        assert_ne!(handle.reference(), seed);
    }
}
