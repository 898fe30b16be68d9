//! Raw-mode terminal keyboard reader.
//!
//! Single key presses are mapped through [`flight_control::input`] and posted
//! to the control loop. The reader never blocks the loop: it only talks to a
//! [`ControlHandle`].

use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use flight_control::control_loop::LoopPhase;
use flight_control::input::{self, KeyOutcome};
use flight_control::ControlHandle;
use tracing::debug;

/// Puts the terminal in raw mode and restores it on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            eprintln!("Failed to restore terminal: {e}");
        }
    }
}

/// Character a key event stands for, if any.
///
/// Ctrl-C maps to `Q` since raw mode swallows the interrupt signal.
pub fn key_char(event: &KeyEvent) -> Option<char> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    match event.code {
        KeyCode::Char('c') if event.modifiers.contains(KeyModifiers::CONTROL) => Some('Q'),
        KeyCode::Char(c) => Some(c),
        _ => None,
    }
}

/// Print in raw mode, where a bare `\n` does not return the carriage.
fn print_raw(message: &str) -> io::Result<()> {
    let mut out = io::stdout();
    for line in message.lines() {
        write!(out, "{line}\r\n")?;
    }
    out.flush()
}

/// Read keys until `Q`, Ctrl-C, or the control loop stops.
pub fn run(control: &ControlHandle, poll_interval: Duration) -> io::Result<()> {
    loop {
        if control.status().phase == LoopPhase::Stopped {
            debug!("Control loop stopped, leaving keyboard loop");
            return Ok(());
        }
        if !event::poll(poll_interval)? {
            continue;
        }

        let Event::Key(key) = event::read()? else {
            continue;
        };
        let Some(c) = key_char(&key) else {
            continue;
        };

        let (outcome, message) = input::apply(input::parse_key(c), control);
        if let Some(message) = message {
            print_raw(&message)?;
        }
        if outcome == KeyOutcome::Quit {
            print_raw("Bye!")?;
            return Ok(());
        }
    }
}
