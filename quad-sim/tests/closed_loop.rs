//! Closed-loop flights of the controller against the simulated vehicle.

use std::thread;
use std::time::{Duration, Instant};

use flight_control::control_loop::{ControlError, LoopPhase};
use flight_control::waypoints::{SequencerSettings, Waypoint};
use flight_control::{
    ConfigHandle, ControlLoop, ControllerConfig, FlightLog, LoopSettings, StateEstimateStore,
    WaypointPlan, WaypointSequencer,
};
use nalgebra::Vector3;
use quad_sim::{QuadModel, QuadParams, QuadState, SimLink, SimSettings};

fn loop_settings() -> LoopSettings {
    LoopSettings {
        connect_timeout: Duration::from_secs(2),
        connect_poll: Duration::from_millis(10),
        reset_pulse: Duration::from_millis(10),
        warmup: Duration::from_millis(50),
        ..LoopSettings::default()
    }
}

fn sim_at(x: f64, y: f64) -> SimLink {
    let model = QuadModel::new(
        QuadParams::default(),
        QuadState::at(Vector3::new(x, y, 0.0)),
    );
    SimLink::spawn(
        model,
        SimSettings {
            connect_delay: Duration::from_millis(30),
            position_noise: 0.002,
            seed: 11,
            ..SimSettings::default()
        },
    )
    .unwrap()
}

/// Poll `predicate` until it holds or `timeout` passes.
fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    predicate()
}

#[test]
fn test_takeoff_and_hover() {
    let sim = sim_at(0.3, -0.2);
    let observer = sim.state_probe();
    let store = StateEstimateStore::new();
    let config = ConfigHandle::new(ControllerConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let log = FlightLog::create(&dir.path().join("hover.csv"), 256).unwrap();

    let control = ControlLoop::new(sim, store, config, loop_settings()).with_flight_log(log);
    let handle = control.handle();
    let thread = control.spawn().unwrap();

    assert_eq!(
        handle.wait_until_started(Duration::from_secs(5)),
        LoopPhase::Running
    );
    let initial = handle.initial_reference().unwrap();
    assert!((initial.position.x - 0.3).abs() < 0.05);
    assert_eq!(initial.position.z, 1.0);

    handle.enable();
    assert!(handle.wait_until_armed(Duration::from_secs(1)));

    let hovering = wait_for(Duration::from_secs(20), || {
        let s = observer.state();
        (s.position.z - 1.0).abs() < 0.1 && s.velocity.norm() < 0.1
    });
    assert!(hovering, "never settled: {:?}", observer.state());
    assert!(handle.is_armed());

    handle.shutdown();
    let summary = thread.join().unwrap().unwrap();
    let log = summary.flight_log.unwrap();
    assert!(log.written > 0);
    assert!(!handle.is_armed());
}

#[test]
fn test_flies_relative_waypoint_plan() {
    let sim = sim_at(0.0, 0.0);
    let observer = sim.state_probe();
    let store = StateEstimateStore::new();

    let mut config = ControllerConfig::default();
    config.waypoint_margin = 0.15;
    config.waypoints = WaypointPlan::new(
        vec![
            Waypoint {
                x: 0.0,
                y: 0.0,
                z: 1.0,
                yaw_deg: 0.0,
            },
            Waypoint {
                x: 0.5,
                y: 0.0,
                z: 1.0,
                yaw_deg: 0.0,
            },
        ],
        true,
    );
    let config = ConfigHandle::new(config);

    let control = ControlLoop::new(sim, store, config.clone(), loop_settings());
    let handle = control.handle();
    let thread = control.spawn().unwrap();
    assert_eq!(
        handle.wait_until_started(Duration::from_secs(5)),
        LoopPhase::Running
    );

    let initial = handle.initial_reference().unwrap();
    let mut sequencer = WaypointSequencer::new(
        initial,
        SequencerSettings {
            arm_timeout: Duration::from_secs(2),
            ..SequencerSettings::default()
        },
    );

    handle.enable();
    let flown = sequencer.run(&handle, &config);
    assert_eq!(flown, Ok(()));

    // The sequencer disarms after the last waypoint
    assert!(wait_for(Duration::from_secs(1), || !handle.is_armed()));
    let reached = observer.state();
    assert!(
        (reached.position.x - 0.5).abs() < 0.3,
        "ended at {:?}",
        reached.position
    );

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_link_loss_disarms() {
    let model = QuadModel::new(QuadParams::default(), QuadState::at(Vector3::zeros()));
    let sim = SimLink::spawn(
        model,
        SimSettings {
            connect_delay: Duration::from_millis(10),
            link_loss_after: Some(Duration::from_millis(600)),
            ..SimSettings::default()
        },
    )
    .unwrap();

    let control = ControlLoop::new(
        sim,
        StateEstimateStore::new(),
        ConfigHandle::new(ControllerConfig::default()),
        loop_settings(),
    );
    let handle = control.handle();
    let thread = control.spawn().unwrap();
    assert_eq!(
        handle.wait_until_started(Duration::from_secs(5)),
        LoopPhase::Running
    );
    handle.enable();
    assert!(handle.wait_until_armed(Duration::from_secs(1)));

    assert!(wait_for(Duration::from_secs(3), || !handle.is_armed()));
    assert!(handle.status().last_fault.is_some());

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_missing_variable_aborts_startup() {
    let model = QuadModel::new(QuadParams::default(), QuadState::at(Vector3::zeros()));
    let sim = SimLink::spawn(
        model,
        SimSettings {
            connect_delay: Duration::from_millis(10),
            missing_variable: Some("kalman.stateZ".to_string()),
            ..SimSettings::default()
        },
    )
    .unwrap();

    let control = ControlLoop::new(
        sim,
        StateEstimateStore::new(),
        ConfigHandle::new(ControllerConfig::default()),
        loop_settings(),
    );
    let handle = control.handle();
    let result = control.run();

    assert!(matches!(result, Err(ControlError::Link(_))));
    assert_eq!(handle.status().phase, LoopPhase::Stopped);
}
