//! End-to-end scenarios against the simulated hardware seams.
//!
//! Each test builds a full coordinator over recording pins, a feedable
//! spindle counter and a settable clock, then pumps the motion tick the
//! way the motion task would.

use std::sync::{Arc, Mutex};

use els_common::config::{AxisConfig, EncoderConfig, MachineConfig};
use els_common::error::CoreError;
use els_common::settings::SettingsSnapshot;
use els_common::state::{AxisId, EstopReason, Mode};
use els_hal::sim::PinLog;
use els_hal::{RecordingPins, SimClock, SimCounter};
use els_motion::MotionCoordinator;

struct Rig {
    coordinator: MotionCoordinator<RecordingPins, SimCounter, SimClock>,
    clock: SimClock,
    spindle: SimCounter,
    z_log: Arc<Mutex<PinLog>>,
    x_log: Arc<Mutex<PinLog>>,
    #[allow(dead_code)]
    a1_log: Arc<Mutex<PinLog>>,
}

fn machine_config() -> MachineConfig {
    MachineConfig {
        z: AxisConfig {
            name: 'Z',
            active: true,
            rotational: false,
            motor_steps_per_rev: 1_600.0,
            screw_pitch_du: 20_000.0,
            start_speed: 700,
            manual_max_speed: 8_000,
            acceleration: 20_000,
            invert_direction: false,
            needs_rest: false,
            max_travel_mm: 300,
            backlash_du: 0,
        },
        x: AxisConfig {
            name: 'X',
            active: true,
            rotational: false,
            motor_steps_per_rev: 800.0,
            screw_pitch_du: 10_000.0,
            start_speed: 500,
            manual_max_speed: 5_000,
            acceleration: 15_000,
            invert_direction: true,
            needs_rest: true,
            max_travel_mm: 100,
            backlash_du: 0,
        },
        a1: AxisConfig {
            name: 'C',
            active: true,
            rotational: true,
            motor_steps_per_rev: 3_200.0,
            screw_pitch_du: 3_600_000.0,
            start_speed: 400,
            manual_max_speed: 3_000,
            acceleration: 10_000,
            invert_direction: false,
            needs_rest: true,
            max_travel_mm: 1_000,
            backlash_du: 0,
        },
        encoder: EncoderConfig::default(),
    }
}

fn rig() -> Rig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let clock = SimClock::new();
    let z_pins = RecordingPins::new(clock.clone());
    let x_pins = RecordingPins::new(clock.clone());
    let a1_pins = RecordingPins::new(clock.clone());
    let z_log = z_pins.log();
    let x_log = x_pins.log();
    let a1_log = a1_pins.log();
    let spindle = SimCounter::new(EncoderConfig::default().counter_limit);

    let coordinator = MotionCoordinator::new(
        &machine_config(),
        z_pins,
        x_pins,
        a1_pins,
        spindle.clone(),
        clock.clone(),
    )
    .expect("valid test config");

    Rig {
        coordinator,
        clock,
        spindle,
        z_log,
        x_log,
        a1_log,
    }
}

/// Pump the motion tick, optionally feeding spindle pulses each cycle.
fn pump(rig: &Rig, iterations: usize, feed_per_iter: i32, us_per_iter: u64) {
    for _ in 0..iterations {
        if feed_per_iter != 0 {
            rig.spindle.feed(feed_per_iter);
        }
        rig.coordinator.tick();
        rig.clock.advance_us(us_per_iter);
    }
}

fn z_pos(rig: &Rig) -> i64 {
    rig.coordinator.axis_snapshot(AxisId::Z).unwrap().pos
}

fn x_pos(rig: &Rig) -> i64 {
    rig.coordinator.axis_snapshot(AxisId::X).unwrap().pos
}

#[test]
fn normal_mode_follows_one_spindle_revolution() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();

    // Synchronized zero: no motion before the spindle turns.
    pump(&rig, 50, 0, 100);
    assert_eq!(rig.z_log.lock().unwrap().step_count(), 0);

    // One revolution (2400 pulses) moves Z one pitch: 800 steps.
    pump(&rig, 2_400, 1, 100);
    pump(&rig, 10_000, 0, 100);
    assert_eq!(z_pos(&rig), 800);
}

#[test]
fn normal_mode_ignores_spindle_jitter_within_backlash() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();

    pump(&rig, 1_200, 1, 100);
    pump(&rig, 5_000, 0, 100);
    let settled = z_pos(&rig);

    // A two-pulse reversal sits inside the encoder backlash window:
    // the averaged position must not move the axis backward.
    rig.spindle.feed(-2);
    pump(&rig, 2_000, 0, 100);
    assert_eq!(z_pos(&rig), settled);
}

#[test]
fn soft_limit_clamps_and_arms_resync() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_left_stop(AxisId::Z, Some(1_000)).unwrap();
    c.set_right_stop(AxisId::Z, Some(-1_000)).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();

    // 3600 pulses put the raw target at 1200 steps; the axis must
    // hold at the left stop instead.
    pump(&rig, 3_600, 1, 100);
    pump(&rig, 10_000, 0, 100);
    assert_eq!(z_pos(&rig), 1_000);

    // Parked on the stop with the spindle 600 pulses past the stop
    // phase: re-entry synchronization is armed with that offset.
    assert_eq!(c.status().unwrap().sync_offset, 600);

    // No further forward motion while out of sync, even across the
    // phase boundary.
    let steps_before = rig.z_log.lock().unwrap().step_count();
    pump(&rig, 2_400, 1, 100);
    pump(&rig, 2_000, 0, 100);
    assert_eq!(rig.z_log.lock().unwrap().step_count(), steps_before);

    // Reversing the spindle brings it back through the matching phase;
    // the axis comes off the stop and follows back down.
    pump(&rig, 6_000, -1, 100);
    pump(&rig, 10_000, 0, 100);
    assert!(z_pos(&rig) < 1_000, "axis never left the stop");
    assert_eq!(c.status().unwrap().sync_offset, 0);
}

#[test]
fn pitch_change_resets_synchronization() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_pitch(500).unwrap();
    c.set_enabled(true).unwrap();

    pump(&rig, 4_800, 1, 100);
    pump(&rig, 5_000, 0, 100);
    let pos_before = z_pos(&rig);
    assert!(pos_before > 0);

    c.set_pitch(1_000).unwrap();

    // The origin absorbed the position; the spindle frame is zeroed.
    let snap = c.axis_snapshot(AxisId::Z).unwrap();
    assert_eq!(snap.pos, 0);
    assert_eq!(snap.origin_offset, pos_before);
    let status = c.status().unwrap();
    assert_eq!(status.spindle_position, 0);
    assert_eq!(status.spindle_avg_position, 0);

    // No lurch: with the spindle still, no steps are emitted.
    let steps_before = rig.z_log.lock().unwrap().step_count();
    pump(&rig, 3_000, 0, 100);
    assert_eq!(rig.z_log.lock().unwrap().step_count(), steps_before);
}

#[test]
fn turn_mode_requires_all_stops() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::Turn).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_left_stop(AxisId::Z, Some(400)).unwrap();
    // Right Z stop and both X stops missing.

    let err = c.set_enabled(true).unwrap_err();
    assert!(matches!(err, CoreError::Preconditions { .. }));
    assert!(!c.status().unwrap().enabled);
}

#[test]
fn turn_mode_runs_all_passes_to_completion() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::Turn).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_turn_passes(2).unwrap();
    c.set_left_stop(AxisId::Z, Some(400)).unwrap();
    c.set_right_stop(AxisId::Z, Some(0)).unwrap();
    c.set_left_stop(AxisId::X, Some(0)).unwrap();
    c.set_right_stop(AxisId::X, Some(-200)).unwrap();
    c.set_enabled(true).unwrap();

    // Keep the spindle turning; the sequencer interleaves rapids and
    // synchronous passes until both passes are done and it disables
    // itself.
    let mut completed = false;
    for _ in 0..300_000 {
        rig.spindle.feed(2);
        rig.coordinator.tick();
        rig.clock.advance_us(100);
        if !c.status().unwrap().enabled {
            completed = true;
            break;
        }
    }
    assert!(completed, "turn operation never completed");

    // Both axes did real work.
    assert!(rig.z_log.lock().unwrap().step_count() > 800);
    assert!(rig.x_log.lock().unwrap().step_count() >= 400);

    // The tool ended retracted: X at its outside stop, Z returned.
    let x = rig.coordinator.axis_snapshot(AxisId::X).unwrap();
    assert_eq!(Some(x.pos), x.left_stop);
    let z = rig.coordinator.axis_snapshot(AxisId::Z).unwrap();
    assert_eq!(Some(z.pos), z.right_stop);
}

#[test]
fn thread_mode_completes_phase_locked_pass() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::Thread).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_turn_passes(1).unwrap();
    c.set_left_stop(AxisId::Z, Some(400)).unwrap();
    c.set_right_stop(AxisId::Z, Some(0)).unwrap();
    c.set_left_stop(AxisId::X, Some(0)).unwrap();
    c.set_right_stop(AxisId::X, Some(-200)).unwrap();
    c.set_enabled(true).unwrap();

    let mut completed = false;
    for _ in 0..300_000 {
        rig.spindle.feed(2);
        rig.coordinator.tick();
        rig.clock.advance_us(100);
        if !c.status().unwrap().enabled {
            completed = true;
            break;
        }
    }
    assert!(completed, "thread operation never completed");
    assert!(rig.z_log.lock().unwrap().step_count() >= 800);
}

#[test]
fn cut_mode_grooves_without_main_axis() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::Cut).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_turn_passes(2).unwrap();
    c.set_left_stop(AxisId::X, Some(0)).unwrap();
    c.set_right_stop(AxisId::X, Some(-200)).unwrap();
    c.set_enabled(true).unwrap();

    let mut completed = false;
    for _ in 0..200_000 {
        rig.coordinator.tick();
        rig.clock.advance_us(100);
        if !c.status().unwrap().enabled {
            completed = true;
            break;
        }
    }
    assert!(completed, "cut operation never completed");
    // Z never moved; X fed in and retracted twice.
    assert_eq!(rig.z_log.lock().unwrap().step_count(), 0);
    assert!(rig.x_log.lock().unwrap().step_count() >= 600);
    let x = rig.coordinator.axis_snapshot(AxisId::X).unwrap();
    assert_eq!(Some(x.pos), x.left_stop);
}

#[test]
fn async_mode_feeds_without_spindle() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::Async).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();

    // One virtual revolution per second: after one second of sim time
    // Z is within the ramp lag of one pitch (800 steps).
    pump(&rig, 10_000, 0, 100);
    let pos = z_pos(&rig);
    assert!((700..=810).contains(&pos), "async position {pos}");
}

#[test]
fn cone_mode_couples_cross_slide() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::Cone).unwrap();
    c.set_pitch(10_000).unwrap();
    c.set_cone_ratio(1.0).unwrap();
    c.set_enabled(true).unwrap();

    pump(&rig, 2_400, 1, 100);
    pump(&rig, 10_000, 0, 100);

    // One revolution: Z one pitch forward, X half the cone ratio of
    // the Z travel, feeding inward.
    assert_eq!(z_pos(&rig), 800);
    assert_eq!(x_pos(&rig), -400);
}

#[test]
fn gcode_mode_rejects_operator_input_and_executes_targets() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::GCode).unwrap();
    c.set_enabled(true).unwrap();

    // Operator surface is locked out while the program runs.
    assert!(matches!(
        c.set_pitch(5_000),
        Err(CoreError::Preconditions { .. })
    ));
    assert!(matches!(
        c.set_left_stop(AxisId::Z, Some(100)),
        Err(CoreError::Preconditions { .. })
    ));
    assert!(matches!(
        c.set_mode(Mode::Normal),
        Err(CoreError::Preconditions { .. })
    ));

    // Parser-fed targets execute.
    c.gcode_move_to(AxisId::Z, 10_000, Some(4_000)).unwrap();
    pump(&rig, 20_000, 0, 100);
    assert!(c.gcode_targets_reached(0));
    assert_eq!(z_pos(&rig), 800);

    // Emergency stop is never locked out.
    c.emergency_stop(EstopReason::OffDuringManualMove);
    assert!(c.status().unwrap().estop.is_some());
}

#[test]
fn a1_mode_indexes_rotary_axis() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_mode(Mode::A1).unwrap();
    c.set_enabled(true).unwrap();

    // 90 degrees on a 3200-step rotary axis is 800 steps.
    c.index_a1(900_000).unwrap();
    pump(&rig, 20_000, 0, 100);
    let a1 = c.axis_snapshot(AxisId::A1).unwrap();
    assert_eq!(a1.pos, 800);
    // Z and X stayed idle.
    assert_eq!(rig.z_log.lock().unwrap().step_count(), 0);
    assert_eq!(rig.x_log.lock().unwrap().step_count(), 0);
}

#[test]
fn emergency_stop_latches_and_recovers() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();

    c.emergency_stop(EstopReason::TravelEnvelope);
    assert_eq!(c.status().unwrap().estop, Some(EstopReason::TravelEnvelope));
    assert!(!c.status().unwrap().enabled);

    // Inert: commands rejected, ticks do nothing.
    assert!(matches!(
        c.set_enabled(true),
        Err(CoreError::EmergencyStop(EstopReason::TravelEnvelope))
    ));
    let steps = rig.z_log.lock().unwrap().step_count();
    pump(&rig, 1_000, 2, 100);
    assert_eq!(rig.z_log.lock().unwrap().step_count(), steps);

    // Recovery must name the latched reason.
    assert!(c.recover_from_emergency(EstopReason::KeyStuckAtBoot).is_err());
    c.recover_from_emergency(EstopReason::TravelEnvelope).unwrap();
    assert_eq!(c.status().unwrap().estop, None);

    // Back in service.
    c.set_enabled(true).unwrap();
    assert!(c.status().unwrap().enabled);
}

#[test]
fn boot_key_stuck_trips_before_motion() {
    let rig = rig();
    let c = &rig.coordinator;
    assert!(matches!(
        c.boot_integrity_check(true),
        Err(CoreError::EmergencyStop(EstopReason::KeyStuckAtBoot))
    ));
    assert!(matches!(
        c.set_enabled(true),
        Err(CoreError::EmergencyStop(EstopReason::KeyStuckAtBoot))
    ));
}

#[test]
fn runtime_envelope_violation_trips() {
    let rig = rig();
    let c = &rig.coordinator;

    // A restored origin far outside the travel range puts the absolute
    // position out of the envelope on the very next tick.
    let snapshot = SettingsSnapshot {
        z: els_common::settings::AxisSettings {
            origin_offset: 500_000,
            left_stop: None,
            right_stop: None,
        },
        ..SettingsSnapshot::default()
    };
    c.restore_settings(&snapshot).unwrap();

    rig.coordinator.tick();
    assert_eq!(c.status().unwrap().estop, Some(EstopReason::TravelEnvelope));
}

#[test]
fn settings_round_trip_between_sessions() {
    let rig_a = rig();
    let c = &rig_a.coordinator;
    c.set_mode(Mode::Thread).unwrap();
    c.set_pitch(-15_000).unwrap();
    c.set_starts(2).unwrap();
    c.set_turn_passes(5).unwrap();
    c.set_aux_direction(false).unwrap();
    c.set_left_stop(AxisId::Z, Some(4_000)).unwrap();
    c.set_right_stop(AxisId::Z, Some(-4_000)).unwrap();
    let snapshot = c.capture_settings().unwrap();

    let rig_b = rig();
    rig_b.coordinator.restore_settings(&snapshot).unwrap();
    let status = rig_b.coordinator.status().unwrap();
    assert_eq!(status.mode, Mode::Thread);
    assert_eq!(status.pitch_du, -15_000);
    assert_eq!(status.starts, 2);
    assert_eq!(status.turn_passes, 5);
    assert!(!status.aux_direction_forward);
    let z = rig_b.coordinator.axis_snapshot(AxisId::Z).unwrap();
    assert_eq!(z.left_stop, Some(4_000));
    assert_eq!(z.right_stop, Some(-4_000));
}

#[test]
fn stale_settings_schema_rejected() {
    let rig = rig();
    let snapshot = SettingsSnapshot {
        schema_version: 1,
        ..SettingsSnapshot::default()
    };
    assert!(matches!(
        rig.coordinator.restore_settings(&snapshot),
        Err(CoreError::InvalidParameter { .. })
    ));
}

#[test]
fn restore_rejected_while_enabled() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();
    assert!(matches!(
        c.restore_settings(&SettingsSnapshot::default()),
        Err(CoreError::Preconditions { .. })
    ));
}

#[test]
fn manual_flag_pauses_normal_following() {
    let rig = rig();
    let c = &rig.coordinator;
    c.set_pitch(10_000).unwrap();
    c.set_enabled(true).unwrap();
    c.set_moving_manually(AxisId::Z, true).unwrap();

    pump(&rig, 2_400, 1, 100);
    pump(&rig, 2_000, 0, 100);
    // Following is suspended while the operator drives the axis.
    assert_eq!(rig.z_log.lock().unwrap().step_count(), 0);

    c.set_moving_manually(AxisId::Z, false).unwrap();
    pump(&rig, 10_000, 0, 100);
    assert!(z_pos(&rig) > 0);
}
