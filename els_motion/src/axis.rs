//! Per-axis stepper engine.
//!
//! Turns a stream of target positions into correctly timed step pulses
//! under trapezoidal acceleration, mechanical-backlash compensation,
//! soft limits and reference-counted driver enable.
//!
//! Two position frames are tracked. `motor_pos` is where the driver
//! shaft is; `pos` is where the tool is. They differ by the backlash
//! the drive train has taken up: the motor leads the tool on forward
//! motion and must traverse the full backlash before the tool moves
//! after a reversal. All target arithmetic in the coordinator uses
//! `pos`; `move_to` bakes the current backlash offset into `pending`.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use els_common::config::AxisConfig;
use els_common::consts::{
    COMMAND_LOCK_TIMEOUT_MS, DIRECTION_SETUP_DELAY_US, RECENT_STEP_WINDOW_US,
    STEPPER_ENABLE_DELAY_MS, STEP_TIMING_SLACK_US,
};
use els_common::error::{CoreError, CoreResult};
use els_common::settings::AxisSettings;
use els_common::state::AxisStatusFlags;
use els_common::units;
use els_hal::{Clock, DriverPins};
use tracing::{debug, info, warn};

/// Immutable per-axis parameters derived from [`AxisConfig`].
#[derive(Debug, Clone)]
pub struct AxisParams {
    /// Axis designator.
    pub name: char,
    /// Whether the axis exists on this machine.
    pub active: bool,
    /// Rotary axes count angular units instead of deci-microns.
    pub rotational: bool,
    /// Motor steps per revolution, microstepping included.
    pub motor_steps_per_rev: f64,
    /// Lead in du (or angular units) per motor revolution.
    pub screw_pitch_du: f64,
    /// Speed of the first step from rest [steps/s].
    pub start_speed: i64,
    /// Manual-move speed ceiling [steps/s].
    pub manual_max_speed: i64,
    /// Acceleration / deceleration rate [steps/s²].
    pub acceleration: i64,
    /// Invert the direction line at the GPIO write.
    pub invert_direction: bool,
    /// De-energize the driver when no consumer holds an enable reference.
    pub needs_rest: bool,
    /// Maximum single-command travel [steps].
    pub estop_steps: i64,
    /// Mechanical backlash [steps].
    pub backlash_steps: i64,
    /// Steps needed to decelerate from manual speed back to start speed.
    pub decelerate_steps: i64,
}

impl AxisParams {
    fn from_config(config: &AxisConfig) -> Self {
        // Braking distance: walk the deceleration curve from manual
        // speed down to start speed, one step at a time.
        let mut decelerate_steps = 0i64;
        let mut s = config.manual_max_speed as f64;
        while s > config.start_speed as f64 {
            decelerate_steps += 1;
            s -= config.acceleration as f64 / s;
        }

        Self {
            name: config.name,
            active: config.active,
            rotational: config.rotational,
            motor_steps_per_rev: config.motor_steps_per_rev,
            screw_pitch_du: config.screw_pitch_du,
            start_speed: config.start_speed,
            manual_max_speed: config.manual_max_speed,
            acceleration: config.acceleration,
            invert_direction: config.invert_direction,
            needs_rest: config.needs_rest,
            estop_steps: config.estop_steps(),
            backlash_steps: config.backlash_steps(),
            decelerate_steps,
        }
    }

    /// Convert deci-microns to steps on this axis's lead.
    #[inline]
    pub fn du_to_steps(&self, du: i64) -> i64 {
        units::steps_from_du(du, self.motor_steps_per_rev, self.screw_pitch_du)
    }

    /// Convert steps to deci-microns on this axis's lead.
    #[inline]
    pub fn steps_to_du(&self, steps: i64) -> i64 {
        units::du_from_steps(steps, self.motor_steps_per_rev, self.screw_pitch_du)
    }
}

/// Point-in-time copy of the axis state for the query surface.
#[derive(Debug, Clone, Copy)]
pub struct AxisSnapshot {
    /// Axis designator.
    pub name: char,
    /// Tool-frame position [steps].
    pub pos: i64,
    /// Cumulative origin offset from absolute zero [steps].
    pub origin_offset: i64,
    /// Driver-frame position [steps].
    pub motor_pos: i64,
    /// Never-reset diagnostic step counter.
    pub pos_global: i64,
    /// Signed steps remaining to the latest target.
    pub pending: i64,
    /// Left soft stop, if set [steps].
    pub left_stop: Option<i64>,
    /// Right soft stop, if set [steps].
    pub right_stop: Option<i64>,
    /// Current speed [steps/s].
    pub speed: f64,
    /// Tool-frame position [du].
    pub position_du: i64,
    /// Diagnostic status word.
    pub flags: AxisStatusFlags,
}

/// Mutable axis state, guarded by the engine mutex.
#[derive(Debug)]
pub(crate) struct AxisCore<D: DriverPins> {
    pins: D,

    pub(crate) pos: i64,
    pub(crate) origin_offset: i64,
    pub(crate) pos_global: i64,
    pub(crate) motor_pos: i64,
    pub(crate) pending: i64,
    pub(crate) left_stop: Option<i64>,
    pub(crate) right_stop: Option<i64>,

    speed: f64,
    speed_max: f64,

    direction: bool,
    direction_initialized: bool,
    last_step_us: Option<u64>,

    enable_counter: u32,
    enable_line: bool,
    pub(crate) disabled_by_user: bool,
    pub(crate) moving_manually: bool,
    pub(crate) continuous: bool,
}

/// One stepper axis: immutable parameters plus the mutex-guarded core.
///
/// Command methods acquire the mutex with a bounded timeout and return
/// [`CoreError::Busy`] on contention so no caller ever blocks the
/// motion tick; the tick itself only ever try-locks.
#[derive(Debug)]
pub struct AxisEngine<D: DriverPins> {
    params: AxisParams,
    core: Mutex<AxisCore<D>>,
}

impl<D: DriverPins> AxisEngine<D> {
    /// Build an axis over its driver pins and put the lines into their
    /// rest state. Drivers that never rest are energized immediately.
    pub fn new(config: &AxisConfig, mut pins: D) -> Self {
        let params = AxisParams::from_config(config);

        pins.write_step(false);
        let enable_line = params.active && !params.needs_rest;
        if enable_line {
            pins.write_enable(true);
        }

        info!(
            axis = %params.name,
            backlash_steps = params.backlash_steps,
            estop_steps = params.estop_steps,
            decelerate_steps = params.decelerate_steps,
            "axis engine created"
        );

        Self {
            core: Mutex::new(AxisCore {
                pins,
                pos: 0,
                origin_offset: 0,
                pos_global: 0,
                motor_pos: 0,
                pending: 0,
                left_stop: None,
                right_stop: None,
                speed: params.start_speed as f64,
                speed_max: params.manual_max_speed as f64,
                direction: true,
                direction_initialized: false,
                last_step_us: None,
                enable_counter: 0,
                enable_line,
                disabled_by_user: false,
                moving_manually: false,
                continuous: false,
            }),
            params,
        }
    }

    /// Immutable parameters of this axis.
    #[inline]
    pub fn params(&self) -> &AxisParams {
        &self.params
    }

    fn lock_command(&self) -> CoreResult<MutexGuard<'_, AxisCore<D>>> {
        let deadline = Instant::now() + Duration::from_millis(COMMAND_LOCK_TIMEOUT_MS);
        loop {
            if let Ok(guard) = self.core.try_lock() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                warn!(axis = %self.params.name, "command dropped, axis mutex busy");
                return Err(CoreError::Busy { what: "axis" });
            }
            std::thread::yield_now();
        }
    }

    /// Run `f` under the axis mutex without blocking; `None` when the
    /// mutex is contended. Motion-tick path only.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut AxisCore<D>) -> R) -> Option<R> {
        self.core.try_lock().ok().map(|mut guard| f(&mut guard))
    }

    /// Command the axis toward `target` (tool-frame steps).
    ///
    /// A `continuous` target is expected to keep moving (synchronous
    /// following); a final target decelerates to rest.
    ///
    /// # Errors
    ///
    /// [`CoreError::TravelExceeded`] when the travel is beyond the
    /// mechanical envelope (state unchanged), [`CoreError::Busy`] on
    /// mutex contention.
    pub fn move_to(&self, target: i64, continuous: bool) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        self.move_to_core(&mut core, target, continuous)
    }

    pub(crate) fn try_move_to(&self, target: i64, continuous: bool) -> CoreResult<()> {
        let mut core = self
            .core
            .try_lock()
            .map_err(|_| CoreError::Busy { what: "axis" })?;
        self.move_to_core(&mut core, target, continuous)
    }

    fn move_to_core(
        &self,
        core: &mut AxisCore<D>,
        target: i64,
        continuous: bool,
    ) -> CoreResult<()> {
        let travel = (target - core.pos).abs();
        if travel > self.params.estop_steps {
            warn!(
                axis = %self.params.name,
                travel,
                limit = self.params.estop_steps,
                "target rejected, travel exceeds envelope"
            );
            return Err(CoreError::TravelExceeded {
                axis: self.params.name,
                requested_steps: travel,
                limit_steps: self.params.estop_steps,
            });
        }

        core.continuous = continuous;
        if target == core.pos {
            core.pending = 0;
        } else {
            // Reverse targets must first traverse the backlash before
            // the tool moves, so it is baked into the step budget.
            let backlash = if target > core.pos {
                0
            } else {
                self.params.backlash_steps
            };
            core.pending = target - core.motor_pos - backlash;
        }
        Ok(())
    }

    /// Emit at most one step pulse if one is due.
    ///
    /// Call as often as possible; cadence is derived from the current
    /// speed, never from the call rate.
    pub fn tick<C: Clock>(&self, clock: &C) {
        let Ok(mut core) = self.core.try_lock() else {
            return;
        };

        if core.pending == 0 {
            // Idle: bleed speed back toward the floor so the next move
            // starts from a safe ramp point.
            if core.speed > self.params.start_speed as f64 {
                core.speed -= 1.0;
            }
            return;
        }

        let now = clock.now_us();
        let interval_us = 1_000_000.0 / core.speed;
        if let Some(last) = core.last_step_us {
            let elapsed = now.saturating_sub(last) as f64;
            if elapsed < interval_us - STEP_TIMING_SLACK_US as f64 {
                return;
            }
        }

        let forward = core.pending > 0;
        if core.direction != forward || !core.direction_initialized {
            // Direction changes always restart the ramp from rest and
            // give the driver its setup time on the dir line.
            core.speed = self.params.start_speed as f64;
            core.direction = forward;
            core.direction_initialized = true;
            let line = forward ^ self.params.invert_direction;
            core.pins.write_dir(line);
            clock.delay_us(DIRECTION_SETUP_DELAY_US);
        }

        core.pins.write_step(true);

        let delta = if forward { 1 } else { -1 };
        core.pending -= delta;

        // Tool frame: the motor leads the tool forward and must fall a
        // full backlash behind before the tool follows in reverse.
        if forward && core.motor_pos >= core.pos {
            core.pos += 1;
        } else if !forward && core.motor_pos <= core.pos - self.params.backlash_steps {
            core.pos -= 1;
        }
        core.motor_pos += delta;
        core.pos_global += delta;

        let accelerating = core.continuous
            || core.pending >= self.params.decelerate_steps
            || core.pending <= -self.params.decelerate_steps;
        let ramp = self.params.acceleration as f64 * interval_us / 1_000_000.0;
        core.speed += if accelerating { ramp } else { -ramp };
        core.speed = core
            .speed
            .clamp(self.params.start_speed as f64, core.speed_max);

        core.last_step_us = Some(now);
        core.pins.write_step(false);
    }

    /// Adjust the driver enable reference count.
    ///
    /// The first reference asserts the enable line and waits out the
    /// driver initialization delay; dropping the last reference
    /// de-energizes. Axes that never rest ignore the refcount.
    pub fn set_enabled<C: Clock>(&self, enable: bool, clock: &C) -> CoreResult<()> {
        if !self.params.needs_rest || !self.params.active {
            return Ok(());
        }

        let mut core = self.lock_command()?;
        if enable {
            core.enable_counter += 1;
            if core.enable_counter == 1 {
                self.update_enable_pin(&mut core);
                clock.delay_ms(STEPPER_ENABLE_DELAY_MS);
            }
        } else if core.enable_counter > 0 {
            core.enable_counter -= 1;
            if core.enable_counter == 0 {
                self.update_enable_pin(&mut core);
            }
        }
        debug!(
            axis = %self.params.name,
            counter = core.enable_counter,
            "enable reference adjusted"
        );
        Ok(())
    }

    /// Switch the axis off (or back on) at operator request. A disabled
    /// axis keeps its state but the enable line stays low.
    pub fn set_disabled_by_user(&self, disabled: bool) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        core.disabled_by_user = disabled;
        self.update_enable_pin(&mut core);
        info!(axis = %self.params.name, disabled, "axis operator switch");
        Ok(())
    }

    fn update_enable_pin(&self, core: &mut AxisCore<D>) {
        let on = !core.disabled_by_user
            && (!self.params.needs_rest || core.enable_counter > 0);
        core.enable_line = on;
        core.pins.write_enable(on);
    }

    /// Set or clear the left soft stop [steps].
    pub fn set_left_stop(&self, stop: Option<i64>) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        if core.left_stop != stop {
            core.left_stop = stop;
            info!(axis = %self.params.name, ?stop, "left stop updated");
        }
        Ok(())
    }

    /// Set or clear the right soft stop [steps].
    pub fn set_right_stop(&self, stop: Option<i64>) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        if core.right_stop != stop {
            core.right_stop = stop;
            info!(axis = %self.params.name, ?stop, "right stop updated");
        }
        Ok(())
    }

    /// Make the current tool position the new zero. Stops shift with
    /// the coordinate system; the outstanding target is dropped.
    pub fn set_origin(&self) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        self.set_origin_core(&mut core);
        Ok(())
    }

    pub(crate) fn set_origin_core(&self, core: &mut AxisCore<D>) {
        if let Some(stop) = core.left_stop.as_mut() {
            *stop -= core.pos;
        }
        if let Some(stop) = core.right_stop.as_mut() {
            *stop -= core.pos;
        }
        core.motor_pos -= core.pos;
        core.origin_offset += core.pos;
        core.pos = 0;
        core.pending = 0;
    }

    /// Declare the current position absolute zero without shifting the
    /// coordinate system.
    pub fn reset_origin(&self) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        core.origin_offset = -core.pos;
        Ok(())
    }

    /// Cap the speed [steps/s]. The cap must be reachable from the
    /// ramp floor.
    pub fn set_max_speed(&self, steps_per_sec: i64) -> CoreResult<()> {
        if steps_per_sec < self.params.start_speed {
            return Err(CoreError::InvalidParameter {
                what: "max_speed",
                value: steps_per_sec,
            });
        }
        let mut core = self.lock_command()?;
        core.speed_max = steps_per_sec as f64;
        Ok(())
    }

    /// Restore the manual-move speed ceiling.
    pub fn reset_max_speed(&self) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        core.speed_max = self.params.manual_max_speed as f64;
        Ok(())
    }

    /// Remove the speed cap entirely so an external pacemaker (the
    /// spindle) sets the pace. Motion-tick path only.
    pub(crate) fn lift_speed_cap(&self) {
        let _ = self.with_core(|core| core.speed_max = f64::INFINITY);
    }

    /// Restore the manual speed ceiling. Motion-tick path only.
    pub(crate) fn tick_reset_max_speed(&self) {
        let _ = self.with_core(|core| core.speed_max = self.params.manual_max_speed as f64);
    }

    /// Non-blocking origin set for the motion tick. Returns whether the
    /// mutex was acquired.
    pub(crate) fn try_set_origin(&self) -> bool {
        self.with_core(|core| self.set_origin_core(core)).is_some()
    }

    /// Hard stop: drop the target, zero the enable references and pull
    /// the enable line low. Blocking; emergency path only.
    pub(crate) fn deenergize(&self) {
        let mut core = self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        core.pending = 0;
        core.continuous = false;
        core.enable_counter = 0;
        core.enable_line = false;
        core.pins.write_enable(false);
        warn!(axis = %self.params.name, "axis de-energized");
    }

    /// Re-derive the enable line after an emergency recovery.
    pub(crate) fn refresh_enable(&self) {
        let mut core = self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.update_enable_pin(&mut core);
    }

    /// Flag the axis as driven by manual input.
    pub fn set_moving_manually(&self, manual: bool) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        core.moving_manually = manual;
        Ok(())
    }

    /// Drop any outstanding target at a tick boundary.
    pub(crate) fn clear_pending(&self) {
        let _ = self.with_core(|core| {
            core.pending = 0;
            core.continuous = false;
        });
    }

    /// Whether steps are outstanding or one was emitted recently.
    pub fn is_moving(&self, now_us: u64) -> bool {
        self.with_core(|core| {
            core.pending != 0
                || core
                    .last_step_us
                    .is_some_and(|last| now_us.saturating_sub(last) < RECENT_STEP_WINDOW_US)
        })
        // A contended mutex means the tick is stepping right now.
        .unwrap_or(true)
    }

    /// Whether the latest target has been reached within `tolerance`.
    pub fn is_target_reached(&self, tolerance: i64) -> bool {
        self.with_core(|core| core.pending.abs() <= tolerance)
            .unwrap_or(false)
    }

    /// Restore persisted origin and stops (boot path; no motion yet).
    pub fn restore_settings(&self, settings: &AxisSettings) -> CoreResult<()> {
        let mut core = self.lock_command()?;
        core.origin_offset = settings.origin_offset;
        core.left_stop = settings.left_stop;
        core.right_stop = settings.right_stop;
        Ok(())
    }

    /// Capture persisted origin and stops.
    pub fn capture_settings(&self) -> CoreResult<AxisSettings> {
        let core = self.lock_command()?;
        Ok(AxisSettings {
            origin_offset: core.origin_offset,
            left_stop: core.left_stop,
            right_stop: core.right_stop,
        })
    }

    /// Full diagnostic snapshot for the query surface.
    pub fn snapshot(&self, now_us: u64) -> CoreResult<AxisSnapshot> {
        let core = self.lock_command()?;
        let mut flags = AxisStatusFlags::empty();
        if core.enable_line {
            flags |= AxisStatusFlags::ENABLED;
        }
        if core.pending != 0
            || core
                .last_step_us
                .is_some_and(|last| now_us.saturating_sub(last) < RECENT_STEP_WINDOW_US)
        {
            flags |= AxisStatusFlags::MOVING;
        }
        if core.continuous {
            flags |= AxisStatusFlags::CONTINUOUS;
        }
        if core.left_stop == Some(core.pos) {
            flags |= AxisStatusFlags::AT_LEFT_STOP;
        }
        if core.right_stop == Some(core.pos) {
            flags |= AxisStatusFlags::AT_RIGHT_STOP;
        }
        if core.disabled_by_user {
            flags |= AxisStatusFlags::DISABLED_BY_USER;
        }
        if core.moving_manually {
            flags |= AxisStatusFlags::MANUAL;
        }

        Ok(AxisSnapshot {
            name: self.params.name,
            pos: core.pos,
            origin_offset: core.origin_offset,
            motor_pos: core.motor_pos,
            pos_global: core.pos_global,
            pending: core.pending,
            left_stop: core.left_stop,
            right_stop: core.right_stop,
            speed: core.speed,
            position_du: self.params.steps_to_du(core.pos),
            flags,
        })
    }
}
