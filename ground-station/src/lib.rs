//! Operator side of the quadrotor controller: the terminal keyboard reader
//! and the wiring of a flight session.

pub mod keyboard;
pub mod session;

pub use session::{ensure_config, Session, SessionError, SessionOptions};
