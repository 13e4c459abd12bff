//! Motion coordination: mode dispatch over the spindle and three axes.
//!
//! One coordinator owns the encoder tracker, the three axis engines,
//! the emergency latch and the mode state. The motion task calls
//! [`MotionCoordinator::tick`] every cycle; external collaborators
//! (input, G-code, display, settings) use the command and query surface,
//! which acquires the shared mutex with a bounded timeout and never
//! blocks the tick.
//!
//! Lock order is always shared-state first, then axis. The tick itself
//! only try-locks, so a contended command costs one skipped cycle, not
//! a stall.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use els_common::config::{ConfigError, MachineConfig};
use els_common::consts::{
    COMMAND_LOCK_TIMEOUT_MS, DUPR_MAX, PASSES_MAX, SETTINGS_SCHEMA_VERSION, STARTS_MAX,
};
use els_common::error::{CoreError, CoreResult};
use els_common::settings::SettingsSnapshot;
use els_common::state::{AxisId, EstopReason, Mode};
use els_hal::{Clock, DriverPins, PulseCounter};
use tracing::{debug, info, warn};

use crate::axis::{AxisEngine, AxisSnapshot};
use crate::cycle::CycleStats;
use crate::encoder::EncoderTracker;
use crate::modes;
use crate::modes::pass::{self, OpState, PassStep, StopWindow};
use crate::safety::EstopLatch;

/// Virtual spindle speed for the async mode [pulses/s]: one revolution
/// per second, so the feed rate in du/s equals the pitch.
const ASYNC_PULSES_PER_SEC: f64 = 2_400.0;

/// Mode state and the encoder, guarded by the coordinator mutex so the
/// mode logic always sees one consistent spindle snapshot.
struct Shared<Q: PulseCounter> {
    encoder: EncoderTracker<Q>,
    mode: Mode,
    enabled: bool,
    pitch_du: i64,
    starts: i32,
    cone_ratio: f64,
    turn_passes: i32,
    aux_direction_forward: bool,
    op: OpState,
    /// Sync offset seen last tick, for wrap detection.
    prev_sync_offset: i64,
    /// Async mode: accumulated virtual spindle pulses.
    virtual_pulses: f64,
    /// Async mode: timestamp of the previous accumulation.
    last_async_us: Option<u64>,
    stats: CycleStats,
}

/// Point-in-time copy of the coordinator state for the query surface.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    /// Selected operating mode.
    pub mode: Mode,
    /// Whether mode processing is active.
    pub enabled: bool,
    /// Signed pitch [du/rev].
    pub pitch_du: i64,
    /// Thread starts.
    pub starts: i32,
    /// Cone mode Z-to-X ratio.
    pub cone_ratio: f64,
    /// Passes for multi-pass modes.
    pub turn_passes: i32,
    /// Auxiliary axis direction.
    pub aux_direction_forward: bool,
    /// Current pass of a running multi-pass operation.
    pub current_pass: i32,
    /// Spindle speed estimate [rpm].
    pub rpm: u32,
    /// Raw spindle position [pulses].
    pub spindle_position: i64,
    /// Backlash-compensated spindle position [pulses].
    pub spindle_avg_position: i64,
    /// Diagnostic spindle position, one-revolution modulo [pulses].
    pub spindle_global_position: i64,
    /// Pending phase re-synchronization [pulses]; zero when none.
    pub sync_offset: i64,
    /// Latched emergency reason, if tripped.
    pub estop: Option<EstopReason>,
    /// Motion-tick timing statistics.
    pub cycle: CycleStats,
}

/// The motion coordinator.
pub struct MotionCoordinator<D: DriverPins, Q: PulseCounter, C: Clock> {
    clock: C,
    z: AxisEngine<D>,
    x: AxisEngine<D>,
    a1: AxisEngine<D>,
    shared: Mutex<Shared<Q>>,
    estop: EstopLatch,
}

impl<D: DriverPins, Q: PulseCounter, C: Clock> MotionCoordinator<D, Q, C> {
    /// Build the coordinator from a validated machine configuration and
    /// the hardware seams.
    pub fn new(
        config: &MachineConfig,
        z_pins: D,
        x_pins: D,
        a1_pins: D,
        counter: Q,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let coordinator = Self {
            z: AxisEngine::new(&config.z, z_pins),
            x: AxisEngine::new(&config.x, x_pins),
            a1: AxisEngine::new(&config.a1, a1_pins),
            shared: Mutex::new(Shared {
                encoder: EncoderTracker::new(&config.encoder, counter),
                mode: Mode::Normal,
                enabled: false,
                pitch_du: 0,
                starts: 1,
                cone_ratio: 1.0,
                turn_passes: 3,
                aux_direction_forward: true,
                op: OpState::reset(Mode::Normal, 0),
                prev_sync_offset: 0,
                virtual_pulses: 0.0,
                last_async_us: None,
                stats: CycleStats::new(),
            }),
            clock,
            estop: EstopLatch::new(),
        };
        info!("motion coordinator created");
        Ok(coordinator)
    }

    /// The clock every task must share.
    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn lock_shared(&self) -> CoreResult<MutexGuard<'_, Shared<Q>>> {
        let deadline = Instant::now() + Duration::from_millis(COMMAND_LOCK_TIMEOUT_MS);
        loop {
            if let Ok(guard) = self.shared.try_lock() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                warn!("command dropped, coordinator mutex busy");
                return Err(CoreError::Busy { what: "coordinator" });
            }
            std::thread::yield_now();
        }
    }

    fn axis(&self, id: AxisId) -> &AxisEngine<D> {
        match id {
            AxisId::Z => &self.z,
            AxisId::X => &self.x,
            AxisId::A1 => &self.a1,
        }
    }

    fn check_estop(&self) -> CoreResult<()> {
        match self.estop.reason() {
            Some(reason) => Err(CoreError::EmergencyStop(reason)),
            None => Ok(()),
        }
    }

    // ─── Motion tick ────────────────────────────────────────────────

    /// One motion cycle: encoder, mode dispatch, axis stepping.
    ///
    /// Never blocks. A contended shared mutex skips mode processing for
    /// this cycle; axes with contended mutexes skip their pulse.
    pub fn tick(&self) {
        if self.estop.is_tripped() {
            return;
        }
        let t0 = self.clock.now_us();
        let Ok(mut guard) = self.shared.try_lock() else {
            return;
        };
        let sh = &mut *guard;

        sh.encoder.tick(t0);

        // A sync offset that wrapped to zero this tick: snap the
        // spindle frame onto the parked axis so following resumes
        // without a lurch, exactly on phase.
        if sh.prev_sync_offset != 0 && sh.encoder.sync_offset() == 0 && sh.pitch_du != 0 {
            let axis = if sh.mode == Mode::Face { &self.x } else { &self.z };
            if let Some(pos) = axis.with_core(|c| c.pos) {
                let equiv = modes::spindle_from_axis_pos(
                    axis.params(),
                    pos,
                    sh.pitch_du,
                    sh.starts,
                    sh.encoder.pulses_per_rev(),
                );
                sh.encoder.resync_to(equiv);
                debug!(equiv, "spindle frame re-synchronized");
            }
        }
        sh.prev_sync_offset = sh.encoder.sync_offset();

        if sh.enabled && sh.pitch_du != 0 && sh.encoder.sync_offset() == 0 {
            match sh.mode {
                Mode::Normal => self.run_normal(sh),
                Mode::Async => self.run_async(sh, t0),
                Mode::Cone => self.run_cone(sh),
                Mode::Turn | Mode::Face | Mode::Thread | Mode::Cut | Mode::Ellipse => {
                    self.run_multi_pass(sh)
                }
                // Externally fed: targets arrive through the command
                // surface, the tick only executes them.
                Mode::GCode | Mode::A1 => {}
            }
        }

        if self.check_envelope() {
            return;
        }

        self.z.tick(&self.clock);
        self.x.tick(&self.clock);
        if self.a1.params().active {
            self.a1.tick(&self.clock);
        }

        sh.stats.record(self.clock.now_us().saturating_sub(t0));
    }

    /// Trip the envelope latch if any axis left its mechanical travel
    /// range. Returns whether a trip happened.
    fn check_envelope(&self) -> bool {
        for axis in [&self.z, &self.x, &self.a1] {
            if !axis.params().active {
                continue;
            }
            let beyond = axis
                .with_core(|c| (c.pos + c.origin_offset).abs() > axis.params().estop_steps)
                .unwrap_or(false);
            if beyond {
                if self.estop.trip(EstopReason::TravelEnvelope) {
                    self.deenergize_all();
                }
                return true;
            }
        }
        false
    }

    // ─── Mode dispatch ──────────────────────────────────────────────

    fn run_normal(&self, sh: &mut Shared<Q>) {
        let z = &self.z;
        let Some((pos, manual, left, right)) =
            z.with_core(|c| (c.pos, c.moving_manually, c.left_stop, c.right_stop))
        else {
            return;
        };
        if manual {
            return;
        }

        let ppr = sh.encoder.pulses_per_rev();
        let raw = modes::axis_target_from_spindle(
            z.params(),
            sh.encoder.average_position(),
            sh.pitch_du,
            sh.starts,
            ppr,
        );
        let target = modes::clamp_to_stops(raw, left, right);

        if target != pos {
            let _ = z.try_move_to(target, true);
        } else if target != raw && z.is_target_reached(0) {
            // Parked on a stop while the spindle runs on: arm the
            // phase re-synchronization for re-engagement.
            let equiv =
                modes::spindle_from_axis_pos(z.params(), pos, sh.pitch_du, sh.starts, ppr);
            let offset = sh.encoder.normalize(sh.encoder.position() - equiv);
            if offset != 0 {
                sh.encoder.set_sync_offset(offset);
            }
        }
    }

    fn run_async(&self, sh: &mut Shared<Q>, now_us: u64) {
        let z = &self.z;
        let dt_us = match sh.last_async_us {
            Some(last) => now_us.saturating_sub(last),
            None => 0,
        };
        sh.last_async_us = Some(now_us);
        sh.virtual_pulses += ASYNC_PULSES_PER_SEC * dt_us as f64 / 1_000_000.0;

        let Some((pos, left, right)) = z.with_core(|c| (c.pos, c.left_stop, c.right_stop))
        else {
            return;
        };
        let raw = modes::axis_target_from_spindle(
            z.params(),
            sh.virtual_pulses as i64,
            sh.pitch_du,
            sh.starts,
            sh.encoder.pulses_per_rev(),
        );
        let target = modes::clamp_to_stops(raw, left, right);
        if target != pos {
            let _ = z.try_move_to(target, true);
        }
    }

    fn run_cone(&self, sh: &mut Shared<Q>) {
        if sh.cone_ratio == 0.0 {
            return;
        }
        let z = &self.z;
        let x = &self.x;
        let Some((z_pos, z_manual, z_left, z_right)) =
            z.with_core(|c| (c.pos, c.moving_manually, c.left_stop, c.right_stop))
        else {
            return;
        };
        let Some((x_pos, x_manual, x_left, x_right)) =
            x.with_core(|c| (c.pos, c.moving_manually, c.left_stop, c.right_stop))
        else {
            return;
        };
        if z_manual || x_manual {
            return;
        }

        // The encoder is the sole pacemaker: lift both speed caps.
        z.lift_speed_cap();
        x.lift_speed_cap();

        let ppr = sh.encoder.pulses_per_rev();
        let z_raw = modes::axis_target_from_spindle(
            z.params(),
            sh.encoder.average_position(),
            sh.pitch_du,
            sh.starts,
            ppr,
        );
        let z_target = modes::clamp_to_stops(z_raw, z_left, z_right);

        let z_du = z.params().steps_to_du(z_target);
        let x_raw = modes::cone_coupled_target(
            x.params(),
            z_du,
            sh.cone_ratio,
            sh.aux_direction_forward,
        );
        let x_target = modes::clamp_to_stops(x_raw, x_left, x_right);

        if z_target != z_pos {
            let _ = z.try_move_to(z_target, true);
        }
        if x_target != x_pos {
            let _ = x.try_move_to(x_target, true);
        }
    }

    // ─── Multi-pass modes ───────────────────────────────────────────

    fn window_of(axis: &AxisEngine<D>) -> Option<StopWindow> {
        axis.with_core(|c| match (c.left_stop, c.right_stop) {
            (Some(left), Some(right)) if right <= left => {
                Some(StopWindow { left, right })
            }
            _ => None,
        })
        .flatten()
    }

    fn abort_multi_pass(&self, sh: &mut Shared<Q>, reason: &'static str) {
        warn!(mode = ?sh.mode, reason, "multi-pass operation aborted");
        self.disable_locked(sh);
    }

    fn run_multi_pass(&self, sh: &mut Shared<Q>) {
        let mode = sh.mode;
        let (main, infeed) = match mode {
            Mode::Face => (&self.x, &self.z),
            _ => (&self.z, &self.x),
        };

        // Runtime preconditions hold for the whole operation; any
        // break disables the mode rather than cutting blind.
        if sh.pitch_du == 0
            || (sh.pitch_du >= 0) != (sh.op.pitch_sign >= 0)
            || sh.starts < 1
            || sh.turn_passes < 1
        {
            self.abort_multi_pass(sh, "pitch or pass parameters changed mid-operation");
            return;
        }
        let Some(infeed_window) = Self::window_of(infeed) else {
            self.abort_multi_pass(sh, "infeed stops not set");
            return;
        };
        let main_window = if mode == Mode::Cut {
            None
        } else {
            match Self::window_of(main) {
                Some(window) => Some(window),
                None => {
                    self.abort_multi_pass(sh, "main-axis stops not set");
                    return;
                }
            }
        };

        if sh.op.index >= sh.turn_passes {
            info!(passes = sh.turn_passes, "multi-pass operation complete");
            self.disable_locked(sh);
            return;
        }

        match sh.op.step {
            PassStep::RapidInfeedOut | PassStep::Retract => {
                let target = pass::outside_stop(&infeed_window, sh.aux_direction_forward);
                self.rapid_step(sh, mode, infeed, target);
            }
            PassStep::RapidMainToStart | PassStep::Return => {
                let Some(window) = main_window else {
                    return;
                };
                let target = pass::start_stop(&window, sh.op.pitch_sign);
                self.rapid_step(sh, mode, main, target);
            }
            PassStep::StepIn => {
                let target = pass::step_in_target(
                    &infeed_window,
                    sh.aux_direction_forward,
                    sh.op.index,
                    sh.turn_passes,
                );
                self.rapid_step(sh, mode, infeed, target);
            }
            PassStep::Engage => {
                self.run_engage(sh, mode, main, infeed);
            }
        }
    }

    /// Drive one rapid positioning step; advances the sequencer when
    /// the axis has landed.
    fn rapid_step(&self, sh: &mut Shared<Q>, mode: Mode, axis: &AxisEngine<D>, target: i64) {
        let Some(pos) = axis.with_core(|c| c.pos) else {
            return;
        };
        if pos == target && axis.is_target_reached(0) {
            debug!(axis = %axis.params().name, pass = sh.op.index, step = ?sh.op.step, "pass step complete");
            sh.op.advance_step(mode);
            return;
        }
        axis.tick_reset_max_speed();
        let _ = axis.try_move_to(target, false);
    }

    /// The synchronous cutting phase of a pass.
    fn run_engage(
        &self,
        sh: &mut Shared<Q>,
        mode: Mode,
        main: &AxisEngine<D>,
        infeed: &AxisEngine<D>,
    ) {
        let ppr = sh.encoder.pulses_per_rev();

        if !sh.op.engaged {
            sh.op.engaged = true;
            main.lift_speed_cap();
            if mode == Mode::Thread {
                // Phase-locked re-entry: the frame set at enable stays
                // fixed; wait for the spindle to come around to the
                // phase matching the parked axis.
                let Some(pos) = main.with_core(|c| c.pos) else {
                    sh.op.engaged = false;
                    return;
                };
                let equiv = modes::spindle_from_axis_pos(
                    main.params(),
                    pos,
                    sh.pitch_du,
                    sh.starts,
                    ppr,
                );
                let offset = sh.encoder.normalize(sh.encoder.position() - equiv);
                if offset != 0 {
                    sh.encoder.set_sync_offset(offset);
                    return;
                }
            } else {
                // Every other mode re-zeroes the synchronized frame at
                // the start of the cut.
                if !self.try_set_new_origin(sh) {
                    return;
                }
            }
        }

        if sh.op.advance {
            sh.op.advance = false;
            sh.op.advance_step(mode);
            return;
        }

        // Windows may have shifted with the origin; reread.
        let Some(window) = Self::window_of(main) else {
            self.abort_multi_pass(sh, "main-axis stops lost mid-pass");
            return;
        };
        let far = pass::far_stop(&window, sh.op.pitch_sign);
        let Some(pos) = main.with_core(|c| c.pos) else {
            return;
        };
        if pos == far && main.is_target_reached(0) {
            debug!(pass = sh.op.index, "synchronous phase complete");
            sh.op.advance_step(mode);
            return;
        }

        let raw = modes::axis_target_from_spindle(
            main.params(),
            sh.encoder.average_position(),
            sh.pitch_du,
            sh.starts,
            ppr,
        );
        let target = modes::clamp_to_stops(raw, Some(window.left), Some(window.right));
        if target != pos {
            let _ = main.try_move_to(target, true);
        }

        if mode == Mode::Ellipse {
            self.run_ellipse_infeed(sh, infeed, &window, pos);
        }
    }

    /// Couple the infeed axis to the elliptical sweep of the main axis.
    fn run_ellipse_infeed(
        &self,
        sh: &mut Shared<Q>,
        infeed: &AxisEngine<D>,
        main_window: &StopWindow,
        main_pos: i64,
    ) {
        let Some(infeed_window) = Self::window_of(infeed) else {
            return;
        };
        let span = main_window.span();
        if span == 0 {
            return;
        }
        let start = pass::start_stop(main_window, sh.op.pitch_sign);
        let sweep = (main_pos - start).abs() as f64 / span as f64;
        let depth_fraction = modes::ellipse_infeed_fraction(sweep);

        let outside = pass::outside_stop(&infeed_window, sh.aux_direction_forward);
        let pass_floor = pass::step_in_target(
            &infeed_window,
            sh.aux_direction_forward,
            sh.op.index,
            sh.turn_passes,
        );
        let depth = pass_floor - outside;
        let raw = outside + (depth as f64 * depth_fraction) as i64;
        let target =
            modes::clamp_to_stops(raw, Some(infeed_window.left), Some(infeed_window.right));

        infeed.lift_speed_cap();
        let Some(pos) = infeed.with_core(|c| c.pos) else {
            return;
        };
        if target != pos {
            let _ = infeed.try_move_to(target, true);
        }
    }

    // ─── Origin management ──────────────────────────────────────────

    /// Zero the synchronized frame across every active axis and the
    /// encoder. Failing halfway leaves axes disagreeing about zero,
    /// which is an emergency.
    fn set_new_origin_cmd(&self, sh: &mut Shared<Q>) -> CoreResult<()> {
        let result = self
            .z
            .set_origin()
            .and_then(|_| self.x.set_origin())
            .and_then(|_| {
                if self.a1.params().active {
                    self.a1.set_origin()
                } else {
                    Ok(())
                }
            });
        match result {
            Ok(()) => {
                sh.encoder.reset_position();
                sh.prev_sync_offset = 0;
                Ok(())
            }
            Err(_) => {
                if self.estop.trip(EstopReason::OriginSetFailed) {
                    self.deenergize_all();
                }
                Err(CoreError::EmergencyStop(EstopReason::OriginSetFailed))
            }
        }
    }

    /// Tick-path origin reset. Returns false (and trips) on failure.
    fn try_set_new_origin(&self, sh: &mut Shared<Q>) -> bool {
        let ok = self.z.try_set_origin()
            && self.x.try_set_origin()
            && (!self.a1.params().active || self.a1.try_set_origin());
        if ok {
            sh.encoder.reset_position();
            sh.prev_sync_offset = 0;
        } else if self.estop.trip(EstopReason::OriginSetFailed) {
            self.deenergize_all();
        }
        ok
    }

    fn deenergize_all(&self) {
        self.z.deenergize();
        self.x.deenergize();
        if self.a1.params().active {
            self.a1.deenergize();
        }
    }

    // ─── Command surface ────────────────────────────────────────────

    /// Enable or disable mode processing.
    ///
    /// Enabling checks mode preconditions, takes a driver enable
    /// reference on every active axis and re-zeroes the synchronized
    /// frame. Disabling drops outstanding targets and releases the
    /// driver references.
    pub fn set_enabled(&self, on: bool) -> CoreResult<()> {
        self.check_estop()?;
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        if on == sh.enabled {
            return Ok(());
        }
        if on {
            self.check_enable_preconditions(sh)?;
            self.z.set_enabled(true, &self.clock)?;
            self.x.set_enabled(true, &self.clock)?;
            if self.a1.params().active {
                self.a1.set_enabled(true, &self.clock)?;
            }
            self.set_new_origin_cmd(sh)?;
            sh.op = OpState::reset(sh.mode, sh.pitch_du);
            sh.virtual_pulses = 0.0;
            sh.last_async_us = None;
            sh.enabled = true;
            info!(mode = ?sh.mode, pitch_du = sh.pitch_du, starts = sh.starts, "motion enabled");
        } else {
            self.disable_locked(sh);
        }
        Ok(())
    }

    fn disable_locked(&self, sh: &mut Shared<Q>) {
        if !sh.enabled {
            return;
        }
        sh.enabled = false;
        sh.op = OpState::reset(sh.mode, sh.pitch_du);
        self.z.clear_pending();
        self.x.clear_pending();
        self.a1.clear_pending();
        let _ = self.z.set_enabled(false, &self.clock);
        let _ = self.x.set_enabled(false, &self.clock);
        if self.a1.params().active {
            let _ = self.a1.set_enabled(false, &self.clock);
        }
        info!("motion disabled");
    }

    fn check_enable_preconditions(&self, sh: &Shared<Q>) -> CoreResult<()> {
        let needs_pitch = !matches!(sh.mode, Mode::GCode | Mode::A1);
        if needs_pitch && sh.pitch_du == 0 {
            return Err(CoreError::Preconditions {
                reason: "pitch is zero",
            });
        }
        match sh.mode {
            Mode::Turn | Mode::Face | Mode::Thread | Mode::Ellipse => {
                if Self::window_of(&self.z).is_none() {
                    return Err(CoreError::Preconditions {
                        reason: "both Z stops must be set",
                    });
                }
                if Self::window_of(&self.x).is_none() {
                    return Err(CoreError::Preconditions {
                        reason: "both X stops must be set",
                    });
                }
                if sh.turn_passes < 1 {
                    return Err(CoreError::Preconditions {
                        reason: "at least one pass required",
                    });
                }
            }
            Mode::Cut => {
                if Self::window_of(&self.x).is_none() {
                    return Err(CoreError::Preconditions {
                        reason: "both X stops must be set",
                    });
                }
            }
            Mode::A1 => {
                if !self.a1.params().active {
                    return Err(CoreError::Preconditions {
                        reason: "A1 axis not present",
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn reject_if_gcode(&self, sh: &Shared<Q>) -> CoreResult<()> {
        if sh.mode == Mode::GCode && sh.enabled {
            return Err(CoreError::Preconditions {
                reason: "g-code program active",
            });
        }
        Ok(())
    }

    /// Select the operating mode. An enabled system is disabled first.
    pub fn set_mode(&self, mode: Mode) -> CoreResult<()> {
        self.check_estop()?;
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        if sh.mode == mode {
            return Ok(());
        }
        self.reject_if_gcode(sh)?;
        if sh.enabled {
            self.disable_locked(sh);
        }
        sh.mode = mode;
        sh.op = OpState::reset(mode, sh.pitch_du);
        sh.virtual_pulses = 0.0;
        sh.last_async_us = None;
        info!(?mode, "operating mode selected");
        Ok(())
    }

    /// Set the pitch [du/rev]. The synchronized frame is re-zeroed
    /// first so the change cannot snap an axis to a distant target.
    pub fn set_pitch(&self, pitch_du: i64) -> CoreResult<()> {
        self.check_estop()?;
        if pitch_du.abs() > DUPR_MAX {
            return Err(CoreError::InvalidParameter {
                what: "pitch_du",
                value: pitch_du,
            });
        }
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        self.reject_if_gcode(sh)?;
        self.set_new_origin_cmd(sh)?;
        sh.pitch_du = pitch_du;
        info!(pitch_du, "pitch set");
        Ok(())
    }

    /// Set the number of thread starts. Re-zeroes the frame first.
    pub fn set_starts(&self, starts: i32) -> CoreResult<()> {
        self.check_estop()?;
        if !(1..=STARTS_MAX).contains(&starts) {
            return Err(CoreError::InvalidParameter {
                what: "starts",
                value: starts as i64,
            });
        }
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        self.reject_if_gcode(sh)?;
        self.set_new_origin_cmd(sh)?;
        sh.starts = starts;
        info!(starts, "thread starts set");
        Ok(())
    }

    /// Set the cone-mode axis ratio.
    pub fn set_cone_ratio(&self, ratio: f64) -> CoreResult<()> {
        self.check_estop()?;
        if !ratio.is_finite() {
            return Err(CoreError::InvalidParameter {
                what: "cone_ratio",
                value: 0,
            });
        }
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        self.reject_if_gcode(sh)?;
        sh.cone_ratio = ratio;
        Ok(())
    }

    /// Set the pass count for multi-pass modes.
    pub fn set_turn_passes(&self, passes: i32) -> CoreResult<()> {
        self.check_estop()?;
        if !(1..=PASSES_MAX).contains(&passes) {
            return Err(CoreError::InvalidParameter {
                what: "turn_passes",
                value: passes as i64,
            });
        }
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        self.reject_if_gcode(sh)?;
        sh.turn_passes = passes;
        Ok(())
    }

    /// Choose external or internal work for the auxiliary axis.
    pub fn set_aux_direction(&self, forward: bool) -> CoreResult<()> {
        self.check_estop()?;
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        self.reject_if_gcode(sh)?;
        sh.aux_direction_forward = forward;
        Ok(())
    }

    /// Skip to the next pass of a running multi-pass operation.
    pub fn advance_operation(&self) -> CoreResult<()> {
        self.check_estop()?;
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        self.reject_if_gcode(sh)?;
        sh.op.advance = true;
        Ok(())
    }

    // ─── Per-axis passthroughs ──────────────────────────────────────

    /// Set or clear an axis's left stop [steps].
    pub fn set_left_stop(&self, id: AxisId, stop: Option<i64>) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        self.axis(id).set_left_stop(stop)
    }

    /// Set or clear an axis's right stop [steps].
    pub fn set_right_stop(&self, id: AxisId, stop: Option<i64>) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        self.axis(id).set_right_stop(stop)
    }

    /// Make an axis's current position its new zero.
    pub fn set_origin(&self, id: AxisId) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        self.axis(id).set_origin()
    }

    /// Declare an axis's current position absolute zero.
    pub fn reset_origin(&self, id: AxisId) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        self.axis(id).reset_origin()
    }

    /// Cap an axis's speed [steps/s].
    pub fn set_max_speed(&self, id: AxisId, steps_per_sec: i64) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        self.axis(id).set_max_speed(steps_per_sec)
    }

    /// Restore an axis's manual speed ceiling.
    pub fn reset_max_speed(&self, id: AxisId) -> CoreResult<()> {
        self.check_estop()?;
        self.axis(id).reset_max_speed()
    }

    /// Switch an axis off or on at operator request.
    pub fn set_axis_disabled(&self, id: AxisId, disabled: bool) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        self.axis(id).set_disabled_by_user(disabled)
    }

    /// Flag an axis as under manual control; synchronous modes leave
    /// it alone while the flag is set.
    pub fn set_moving_manually(&self, id: AxisId, manual: bool) -> CoreResult<()> {
        self.check_estop()?;
        self.axis(id).set_moving_manually(manual)
    }

    /// Manual jog: move an axis to a tool-frame target at manual speed.
    pub fn move_axis_manual(&self, id: AxisId, target_steps: i64, continuous: bool) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        self.reject_if_gcode(&guard)?;
        drop(guard);
        let axis = self.axis(id);
        axis.reset_max_speed()?;
        axis.move_to(target_steps, continuous)
    }

    // ─── G-code feed ────────────────────────────────────────────────

    /// Submit one G-code motion target [du] for an axis, with an
    /// optional feed cap [steps/s]. Only valid while a G-code program
    /// is active.
    pub fn gcode_move_to(
        &self,
        id: AxisId,
        target_du: i64,
        feed_steps_per_sec: Option<i64>,
    ) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        if guard.mode != Mode::GCode || !guard.enabled {
            return Err(CoreError::Preconditions {
                reason: "g-code mode not active",
            });
        }
        drop(guard);

        let axis = self.axis(id);
        match feed_steps_per_sec {
            Some(feed) => axis.set_max_speed(feed)?,
            None => axis.reset_max_speed()?,
        }
        let target = axis.params().du_to_steps(target_du);
        let (left, right) = axis
            .with_core(|c| (c.left_stop, c.right_stop))
            .unwrap_or((None, None));
        axis.move_to(modes::clamp_to_stops(target, left, right), false)
    }

    /// Whether every axis has reached its G-code target.
    pub fn gcode_targets_reached(&self, tolerance: i64) -> bool {
        self.z.is_target_reached(tolerance)
            && self.x.is_target_reached(tolerance)
            && (!self.a1.params().active || self.a1.is_target_reached(tolerance))
    }

    // ─── A1 indexing ────────────────────────────────────────────────

    /// Rotate the A1 axis by a relative angle [1/10000 degree units].
    pub fn index_a1(&self, delta_angle: i64) -> CoreResult<()> {
        self.check_estop()?;
        let guard = self.lock_shared()?;
        if guard.mode != Mode::A1 || !guard.enabled {
            return Err(CoreError::Preconditions {
                reason: "A1 mode not active",
            });
        }
        drop(guard);
        let a1 = &self.a1;
        let delta_steps = a1.params().du_to_steps(delta_angle);
        let target = a1
            .with_core(|c| c.pos)
            .ok_or(CoreError::Busy { what: "axis" })?
            + delta_steps;
        a1.reset_max_speed()?;
        a1.move_to(target, false)
    }

    // ─── Emergency stop ─────────────────────────────────────────────

    /// Trip the emergency latch: motion becomes inert and the drivers
    /// de-energize until an explicit recovery.
    pub fn emergency_stop(&self, reason: EstopReason) {
        if self.estop.trip(reason) {
            self.deenergize_all();
            if let Ok(mut guard) = self.shared.try_lock() {
                guard.enabled = false;
            }
        }
    }

    /// Recover from a latched emergency stop by acknowledging its
    /// specific reason. The system comes back disabled.
    pub fn recover_from_emergency(&self, reason: EstopReason) -> CoreResult<()> {
        self.estop.recover(reason)?;
        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        sh.enabled = false;
        sh.op = OpState::reset(sh.mode, sh.pitch_du);
        self.z.refresh_enable();
        self.x.refresh_enable();
        if self.a1.params().active {
            self.a1.refresh_enable();
        }
        Ok(())
    }

    /// Boot-time integrity check: a key held down during power-up
    /// latches an emergency before any motion can start.
    pub fn boot_integrity_check(&self, key_stuck: bool) -> CoreResult<()> {
        if key_stuck {
            self.emergency_stop(EstopReason::KeyStuckAtBoot);
            return Err(CoreError::EmergencyStop(EstopReason::KeyStuckAtBoot));
        }
        Ok(())
    }

    // ─── Settings ───────────────────────────────────────────────────

    /// Capture everything the settings store persists.
    pub fn capture_settings(&self) -> CoreResult<SettingsSnapshot> {
        let guard = self.lock_shared()?;
        Ok(SettingsSnapshot {
            schema_version: SETTINGS_SCHEMA_VERSION,
            mode: guard.mode,
            pitch_du: guard.pitch_du,
            starts: guard.starts,
            cone_ratio: guard.cone_ratio,
            turn_passes: guard.turn_passes,
            aux_direction_forward: guard.aux_direction_forward,
            z: self.z.capture_settings()?,
            x: self.x.capture_settings()?,
            a1: self.a1.capture_settings()?,
        })
    }

    /// Restore a persisted snapshot. Only valid while disabled; a
    /// stale schema or out-of-range values are rejected whole.
    pub fn restore_settings(&self, snapshot: &SettingsSnapshot) -> CoreResult<()> {
        self.check_estop()?;
        if !snapshot.is_current_schema() {
            return Err(CoreError::InvalidParameter {
                what: "schema_version",
                value: snapshot.schema_version as i64,
            });
        }
        if snapshot.pitch_du.abs() > DUPR_MAX {
            return Err(CoreError::InvalidParameter {
                what: "pitch_du",
                value: snapshot.pitch_du,
            });
        }
        if !(1..=STARTS_MAX).contains(&snapshot.starts) {
            return Err(CoreError::InvalidParameter {
                what: "starts",
                value: snapshot.starts as i64,
            });
        }
        if !(1..=PASSES_MAX).contains(&snapshot.turn_passes) {
            return Err(CoreError::InvalidParameter {
                what: "turn_passes",
                value: snapshot.turn_passes as i64,
            });
        }

        let mut guard = self.lock_shared()?;
        let sh = &mut *guard;
        if sh.enabled {
            return Err(CoreError::Preconditions {
                reason: "disable before restoring settings",
            });
        }
        sh.mode = snapshot.mode;
        sh.pitch_du = snapshot.pitch_du;
        sh.starts = snapshot.starts;
        sh.cone_ratio = snapshot.cone_ratio;
        sh.turn_passes = snapshot.turn_passes;
        sh.aux_direction_forward = snapshot.aux_direction_forward;
        sh.op = OpState::reset(sh.mode, sh.pitch_du);
        self.z.restore_settings(&snapshot.z)?;
        self.x.restore_settings(&snapshot.x)?;
        self.a1.restore_settings(&snapshot.a1)?;
        info!("settings restored");
        Ok(())
    }

    // ─── Query surface ──────────────────────────────────────────────

    /// Point-in-time coordinator status.
    pub fn status(&self) -> CoreResult<CoordinatorStatus> {
        let guard = self.lock_shared()?;
        Ok(CoordinatorStatus {
            mode: guard.mode,
            enabled: guard.enabled,
            pitch_du: guard.pitch_du,
            starts: guard.starts,
            cone_ratio: guard.cone_ratio,
            turn_passes: guard.turn_passes,
            aux_direction_forward: guard.aux_direction_forward,
            current_pass: guard.op.index,
            rpm: guard.encoder.rpm(),
            spindle_position: guard.encoder.position(),
            spindle_avg_position: guard.encoder.average_position(),
            spindle_global_position: guard.encoder.global_position(),
            sync_offset: guard.encoder.sync_offset(),
            estop: self.estop.reason(),
            cycle: guard.stats.clone(),
        })
    }

    /// Point-in-time state of one axis.
    pub fn axis_snapshot(&self, id: AxisId) -> CoreResult<AxisSnapshot> {
        self.axis(id).snapshot(self.clock.now_us())
    }

    /// Whether the spindle produced a pulse within the timeout.
    pub fn spindle_is_turning(&self, timeout_us: u64) -> CoreResult<bool> {
        let guard = self.lock_shared()?;
        Ok(guard.encoder.is_spinning(timeout_us, self.clock.now_us()))
    }
}
