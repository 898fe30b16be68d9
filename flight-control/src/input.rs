//! Operator key map.
//!
//! Keys are translated into [`KeyAction`]s and posted to the control loop
//! through a [`ControlHandle`]; reading the terminal is left to the binary.

use nalgebra::Vector3;
use tracing::info;

use crate::control_loop::ControlHandle;

/// Reference step per position key press (m).
pub const POSITION_STEP: f64 = 0.1;

/// Reference step per yaw key press (deg).
pub const YAW_STEP_DEG: f64 = 5.0;

/// Help text printed for `h`.
pub const HELP: &str = "\
Key map:
  >: Increase thrust (non-control mode)
  <: Decrease thrust (non-control mode)
  Q: quit program
  e: Enable motors
  q: Disable motors
  w: Increase x-reference by 0.1 m
  s: Decrease x-reference by 0.1 m
  a: Increase y-reference by 0.1 m
  d: Decrease y-reference by 0.1 m
  i: Increase z-reference by 0.1 m
  k: Decrease z-reference by 0.1 m
  j: Increase yaw-reference by 5 deg
  l: Decrease yaw-reference by 5 deg
  space: Set z-reference to 0 (land)";

/// What a key press asks for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyAction {
    Help,
    IncreaseThrust,
    DecreaseThrust,
    /// Shift the reference position (m)
    Nudge(Vector3<f64>),
    /// Shift the reference yaw (deg)
    Yaw(f64),
    /// Bring the reference down to the ground
    Land,
    Enable,
    Disable,
    /// Disable and exit
    Quit,
    Unrecognized(char),
}

/// Map a key to its action.
pub fn parse_key(key: char) -> KeyAction {
    let step = POSITION_STEP;
    match key {
        'h' => KeyAction::Help,
        '>' => KeyAction::IncreaseThrust,
        '<' => KeyAction::DecreaseThrust,
        'w' => KeyAction::Nudge(Vector3::new(step, 0.0, 0.0)),
        's' => KeyAction::Nudge(Vector3::new(-step, 0.0, 0.0)),
        'a' => KeyAction::Nudge(Vector3::new(0.0, step, 0.0)),
        'd' => KeyAction::Nudge(Vector3::new(0.0, -step, 0.0)),
        'i' => KeyAction::Nudge(Vector3::new(0.0, 0.0, step)),
        'k' => KeyAction::Nudge(Vector3::new(0.0, 0.0, -step)),
        'j' => KeyAction::Yaw(YAW_STEP_DEG),
        'l' => KeyAction::Yaw(-YAW_STEP_DEG),
        ' ' => KeyAction::Land,
        'e' => KeyAction::Enable,
        'q' => KeyAction::Disable,
        'Q' => KeyAction::Quit,
        other => KeyAction::Unrecognized(other),
    }
}

/// Whether the key reader should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Continue,
    Quit,
}

/// Post an action to the loop. Returns the message to show the operator.
pub fn apply(action: KeyAction, control: &ControlHandle) -> (KeyOutcome, Option<String>) {
    let message = match action {
        KeyAction::Help => Some(HELP.to_string()),
        KeyAction::IncreaseThrust => {
            control.increase_thrust();
            None
        }
        KeyAction::DecreaseThrust => {
            control.decrease_thrust();
            None
        }
        KeyAction::Nudge(offset) => {
            control.nudge_reference(offset, 0.0);
            None
        }
        KeyAction::Yaw(degrees) => {
            control.nudge_reference(Vector3::zeros(), degrees.to_radians());
            None
        }
        KeyAction::Land => {
            control.update_reference(|r| r.position.z = 0.0);
            None
        }
        KeyAction::Enable => {
            control.enable();
            None
        }
        KeyAction::Disable => {
            let hint = if control.is_armed() {
                None
            } else {
                Some("Press Q to quit".to_string())
            };
            control.disable();
            hint
        }
        KeyAction::Quit => {
            control.disable();
            info!("Quit requested");
            return (KeyOutcome::Quit, None);
        }
        KeyAction::Unrecognized(key) => Some(format!("Unhandled key {key:?} was pressed")),
    };

    if let Some(msg) = &message {
        if !matches!(action, KeyAction::Help) {
            info!("{msg}");
        }
    }
    (KeyOutcome::Continue, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_loop::Command;
    use approx::assert_relative_eq;

    #[test]
    fn test_key_map() {
        assert_eq!(parse_key('e'), KeyAction::Enable);
        assert_eq!(parse_key('q'), KeyAction::Disable);
        assert_eq!(parse_key('Q'), KeyAction::Quit);
        assert_eq!(parse_key(' '), KeyAction::Land);
        assert_eq!(parse_key('>'), KeyAction::IncreaseThrust);
        assert_eq!(parse_key('<'), KeyAction::DecreaseThrust);
        assert_eq!(parse_key('j'), KeyAction::Yaw(5.0));
        assert_eq!(parse_key('l'), KeyAction::Yaw(-5.0));
        assert_eq!(
            parse_key('a'),
            KeyAction::Nudge(Vector3::new(0.0, 0.1, 0.0))
        );
        assert_eq!(
            parse_key('k'),
            KeyAction::Nudge(Vector3::new(0.0, 0.0, -0.1))
        );
        assert_eq!(parse_key('x'), KeyAction::Unrecognized('x'));
    }

    #[test]
    fn test_nudges_move_reference() {
        let (handle, _rx) = ControlHandle::new();
        let start = handle.reference();

        for key in ['w', 'w', 'd', 'i', 'j'] {
            assert_eq!(apply(parse_key(key), &handle).0, KeyOutcome::Continue);
        }

        let r = handle.reference();
        assert_relative_eq!(r.position.x, start.position.x + 0.2, epsilon = 1e-12);
        assert_relative_eq!(r.position.y, start.position.y - 0.1, epsilon = 1e-12);
        assert_relative_eq!(r.position.z, start.position.z + 0.1, epsilon = 1e-12);
        assert_relative_eq!(r.yaw_degrees(), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_space_lands() {
        let (handle, _rx) = ControlHandle::new();
        apply(parse_key(' '), &handle);
        assert_eq!(handle.reference().position.z, 0.0);
    }

    #[test]
    fn test_arm_keys_post_commands() {
        let (handle, rx) = ControlHandle::new();
        apply(parse_key('e'), &handle);
        apply(parse_key('>'), &handle);
        let (outcome, hint) = apply(parse_key('q'), &handle);

        assert_eq!(outcome, KeyOutcome::Continue);
        assert!(hint.unwrap().contains('Q'));
        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            commands,
            vec![Command::Enable, Command::IncreaseThrust, Command::Disable]
        );
    }

    #[test]
    fn test_quit_disables_and_stops() {
        let (handle, rx) = ControlHandle::new();
        let (outcome, _) = apply(parse_key('Q'), &handle);
        assert_eq!(outcome, KeyOutcome::Quit);
        assert_eq!(rx.try_recv().unwrap(), Command::Disable);
    }

    #[test]
    fn test_unrecognized_key_changes_nothing() {
        let (handle, rx) = ControlHandle::new();
        let before = handle.reference();
        let (outcome, message) = apply(parse_key('z'), &handle);

        assert_eq!(outcome, KeyOutcome::Continue);
        assert!(message.unwrap().contains("'z'"));
        assert_eq!(handle.reference(), before);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_help_lists_every_key() {
        let (handle, _rx) = ControlHandle::new();
        let (_, message) = apply(KeyAction::Help, &handle);
        let help = message.unwrap();
        for key in ["e:", "q:", "Q:", "w:", "space:"] {
            assert!(help.contains(key), "help missing {key}");
        }
    }
}
