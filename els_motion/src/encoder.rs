//! Spindle encoder tracking.
//!
//! Converts the signed pulse stream of the hardware quadrature counter
//! into a continuously advancing position, a backlash-compensated
//! position used by the synchronous modes, and a rolling RPM estimate.
//!
//! The hardware counter is read relatively: only deltas matter, so the
//! counter is cleared whenever it approaches its saturation bounds.
//! Clearing between read and the next pulse can lose at most one pulse,
//! which is accepted.

use els_common::config::EncoderConfig;
use els_common::units::normalize_pulses;
use els_hal::PulseCounter;
use tracing::{debug, trace};

/// Tracks spindle rotation from a hardware quadrature counter.
#[derive(Debug)]
pub struct EncoderTracker<Q: PulseCounter> {
    counter: Q,
    pulses_per_rev: i64,
    backlash_pulses: i64,
    clear_threshold: i32,

    /// Signed pulse count since the last origin reset.
    position: i64,
    /// Backlash-compensated position; never leads `position`, lags it
    /// by at most the backlash window after a reversal.
    position_avg: i64,
    /// Never-reset diagnostic position, normalized to one revolution.
    position_global: i64,
    /// Last value observed on the hardware counter.
    last_counter: i32,

    /// Time of the last observed pulse [µs].
    last_pulse_us: u64,
    /// Start of the current RPM averaging window [µs].
    window_start_us: u64,
    /// Pulses accumulated in the current RPM window.
    window_pulses: i64,
    /// Rolling RPM estimate; holds its last value while coasting.
    rpm: u32,

    /// Pulses until the spindle phase matches a parked axis again.
    /// Zero means no re-synchronization is pending.
    sync_offset: i64,
}

impl<Q: PulseCounter> EncoderTracker<Q> {
    /// Create a tracker over the given hardware counter.
    pub fn new(config: &EncoderConfig, mut counter: Q) -> Self {
        counter.clear();
        Self {
            counter,
            pulses_per_rev: config.pulses_per_rev(),
            backlash_pulses: config.backlash_pulses,
            clear_threshold: config.counter_clear_threshold,
            position: 0,
            position_avg: 0,
            position_global: 0,
            last_counter: 0,
            last_pulse_us: 0,
            window_start_us: 0,
            window_pulses: 0,
            rpm: 0,
            sync_offset: 0,
        }
    }

    /// Poll the hardware counter and fold new pulses into the state.
    ///
    /// Called once per motion tick, before mode dispatch, so all mode
    /// logic in the same tick sees one consistent snapshot.
    pub fn tick(&mut self, now_us: u64) {
        let count = self.counter.read();
        let delta = (count - self.last_counter) as i64;
        if delta == 0 {
            return;
        }

        if count >= self.clear_threshold || count <= -self.clear_threshold {
            // Relative counting: clearing loses nothing but the odd
            // pulse that lands between read and clear.
            self.counter.clear();
            self.last_counter = 0;
            debug!(count, "encoder counter cleared near saturation");
        } else {
            self.last_counter = count;
        }

        self.process_pulses(delta, now_us);
    }

    fn process_pulses(&mut self, delta: i64, now_us: u64) {
        // RPM: one full revolution of pulses per averaging window.
        if self.window_pulses >= self.pulses_per_rev {
            let elapsed = now_us.saturating_sub(self.window_start_us);
            if elapsed > 0 {
                self.rpm = (60_000_000 / elapsed) as u32;
            }
            self.window_start_us = now_us;
            self.window_pulses = 0;
        }
        self.window_pulses += delta.abs();

        self.position += delta;
        self.position_global =
            normalize_pulses(self.position_global + delta, self.pulses_per_rev);

        // Backlash compensation: forward motion tracks immediately,
        // reversals within the backlash window do not move the average.
        if self.position > self.position_avg {
            self.position_avg = self.position;
        } else if self.position < self.position_avg - self.backlash_pulses {
            self.position_avg = self.position + self.backlash_pulses;
        }

        // A pending re-synchronization advances with the spindle and
        // self-clears on the whole-revolution boundary.
        if self.sync_offset != 0 {
            let advanced = self.sync_offset + delta;
            self.sync_offset = if advanced <= 0 || advanced >= self.pulses_per_rev {
                0
            } else {
                advanced
            };
            if self.sync_offset == 0 {
                trace!("sync offset cleared on revolution boundary");
            }
        }

        self.last_pulse_us = now_us;
    }

    /// Raw signed position in pulses.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Backlash-compensated position in pulses.
    #[inline]
    pub fn average_position(&self) -> i64 {
        self.position_avg
    }

    /// Never-reset position, normalized to `[0, pulses_per_rev)`.
    #[inline]
    pub fn global_position(&self) -> i64 {
        self.position_global
    }

    /// Rolling RPM estimate. Holds the last computed value while the
    /// spindle coasts; gate on [`Self::is_spinning`] for liveness.
    #[inline]
    pub fn rpm(&self) -> u32 {
        self.rpm
    }

    /// Counted pulses per spindle revolution.
    #[inline]
    pub fn pulses_per_rev(&self) -> i64 {
        self.pulses_per_rev
    }

    /// Whether a pulse arrived within the timeout.
    #[inline]
    pub fn is_spinning(&self, timeout_us: u64, now_us: u64) -> bool {
        now_us.saturating_sub(self.last_pulse_us) < timeout_us
    }

    /// Zero the synchronized frame: position, averaged position and any
    /// pending sync offset. The global position is untouched.
    pub fn reset_position(&mut self) {
        self.position = 0;
        self.position_avg = 0;
        self.sync_offset = 0;
        debug!("encoder position reset");
    }

    /// Snap the synchronized position to `position` after a sync-offset
    /// wrap, so following resumes without a lurch.
    pub fn resync_to(&mut self, position: i64) {
        self.position = position;
        self.position_avg = position;
    }

    /// Arm a phase re-synchronization. The value is normalized into
    /// `[0, pulses_per_rev)`; zero disarms.
    pub fn set_sync_offset(&mut self, offset: i64) {
        self.sync_offset = normalize_pulses(offset, self.pulses_per_rev);
        debug!(offset = self.sync_offset, "sync offset armed");
    }

    /// Pending sync offset; zero when none.
    #[inline]
    pub fn sync_offset(&self) -> i64 {
        self.sync_offset
    }

    /// Normalize a pulse position into `[0, pulses_per_rev)`.
    #[inline]
    pub fn normalize(&self, pos: i64) -> i64 {
        normalize_pulses(pos, self.pulses_per_rev)
    }
}
