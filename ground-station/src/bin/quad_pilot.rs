//! Fly the position controller against the simulated quadrotor.
//!
//! Subcommands:
//! - `manual`: hover at takeoff altitude and steer from the keyboard
//! - `waypoints`: fly the plan from the config file once armed
//! - `init-config`: write a default config file

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flight_control::waypoints::SequencerSettings;
use flight_control::LoopSettings;
use ground_station::keyboard::{self, RawModeGuard};
use ground_station::{ensure_config, Session, SessionOptions};
use nalgebra::Vector3;
use quad_sim::SimSettings;
use tracing::{info, warn};

/// Poll interval of the keyboard reader
const KEY_POLL: Duration = Duration::from_millis(50);

/// Quadrotor position controller
#[derive(Parser, Debug)]
#[command(name = "quad_pilot")]
#[command(about = "Closed-loop position control of a simulated quadrotor")]
#[command(version)]
struct Args {
    /// Controller config file, reloaded while flying
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Control loop period in milliseconds
    #[arg(long, global = true, default_value = "20")]
    period_ms: u64,

    /// Takeoff altitude in meters
    #[arg(long, global = true, default_value = "1.0")]
    altitude: f64,

    /// Directory for the flight log
    #[arg(long, global = true, default_value = ".")]
    log_dir: PathBuf,

    /// Do not write a flight log
    #[arg(long, global = true)]
    no_log: bool,

    /// Standard deviation of simulated position noise in meters
    #[arg(long, global = true, default_value = "0.0")]
    sim_noise: f64,

    /// Seed for the simulated noise
    #[arg(long, global = true, default_value = "0")]
    seed: u64,

    /// Simulated start position x in meters
    #[arg(long, global = true, default_value = "0.0")]
    start_x: f64,

    /// Simulated start position y in meters
    #[arg(long, global = true, default_value = "0.0")]
    start_y: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hover and steer from the keyboard
    Manual,

    /// Fly the waypoint plan from the config file
    Waypoints {
        /// How long to wait for the operator to arm, in seconds
        #[arg(long, default_value = "300")]
        arm_timeout: u64,
    },

    /// Write a default config file if none exists
    InitConfig,
}

fn session_options(args: &Args) -> SessionOptions {
    SessionOptions {
        config_path: args.config.clone(),
        log_dir: (!args.no_log).then(|| args.log_dir.clone()),
        loop_settings: LoopSettings {
            period: Duration::from_millis(args.period_ms),
            takeoff_altitude: args.altitude,
            ..LoopSettings::default()
        },
        sim: SimSettings {
            position_noise: args.sim_noise,
            seed: args.seed,
            ..SimSettings::default()
        },
        start_position: Vector3::new(args.start_x, args.start_y, 0.0),
        ..SessionOptions::default()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match &args.command {
        Command::Manual => cmd_fly(&args, None),
        Command::Waypoints { arm_timeout } => cmd_fly(
            &args,
            Some(SequencerSettings {
                arm_timeout: Duration::from_secs(*arm_timeout),
                ..SequencerSettings::default()
            }),
        ),
        Command::InitConfig => cmd_init_config(&args),
    }
}

fn cmd_init_config(args: &Args) -> Result<()> {
    if ensure_config(&args.config)
        .with_context(|| format!("Failed to write {}", args.config.display()))?
    {
        println!("Wrote default config to {}", args.config.display());
    } else {
        println!("{} already exists, leaving it alone", args.config.display());
    }
    Ok(())
}

fn cmd_fly(args: &Args, waypoints: Option<SequencerSettings>) -> Result<()> {
    let options = session_options(args);
    let startup_budget = options.loop_settings.connect_timeout
        + options.loop_settings.warmup
        + options.loop_settings.telemetry_timeout
        + Duration::from_secs(1);

    let mut session = Session::start(options).with_context(|| {
        format!(
            "Failed to start session with config {}",
            args.config.display()
        )
    })?;
    session
        .wait_until_ready(startup_budget)
        .context("Control loop failed to start")?;

    let sequencer = match waypoints {
        Some(settings) => Some(session.spawn_waypoints(settings)?),
        None => None,
    };

    println!("Ready! Press e to enable motors, h for help and Q to quit");

    let guard = RawModeGuard::enable().context("Failed to enter raw terminal mode")?;
    let result = keyboard::run(session.handle(), KEY_POLL);
    drop(guard);

    let summary = session.finish()?;
    info!(
        "Ran {} ticks with {} deadline misses",
        summary.ticks, summary.deadline_misses
    );
    if let Some(log) = &summary.flight_log {
        println!(
            "Flight log: {} ({} rows, {} dropped)",
            log.path.display(),
            log.written,
            log.dropped
        );
    }

    if let Some(sequencer) = sequencer {
        match sequencer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Waypoint plan did not complete: {e}"),
            Err(_) => warn!("Waypoint thread panicked"),
        }
    }

    result.context("Keyboard input failed")
}
