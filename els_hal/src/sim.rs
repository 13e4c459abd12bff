//! Simulation implementations of the hardware seams.
//!
//! These doubles back every test in the workspace: the clock is set by
//! the test, the pin recorder captures timestamped step edges, and the
//! counter is fed pulse deltas as if the spindle were turning. All of
//! them are cheaply cloneable handles over shared state so a test can
//! keep a handle while the motion core owns the "hardware".

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::counter::PulseCounter;
use crate::driver::DriverPins;

/// Test clock: time advances only when the test says so.
///
/// `delay_us` advances the clock, so settling delays inside the core
/// are visible in recorded timestamps without real waiting.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
}

impl SimClock {
    /// Create a clock at t = 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `us` microseconds.
    pub fn advance_us(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1_000);
    }
}

impl Clock for SimClock {
    #[inline]
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u64) {
        self.advance_us(us);
    }
}

/// One recorded step pulse (captured on the asserting edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    /// Clock time of the asserting edge [µs].
    pub at_us: u64,
    /// Level on the direction line at the time of the pulse.
    pub forward: bool,
}

/// Everything the pin recorder has observed.
#[derive(Debug, Default)]
pub struct PinLog {
    /// Step pulses in emission order.
    pub steps: Vec<StepEvent>,
    /// Enable line transitions as (time, level).
    pub enable_changes: Vec<(u64, bool)>,
    /// Current level of the enable line.
    pub enabled: bool,
    /// Current level of the direction line.
    pub dir_forward: bool,
}

impl PinLog {
    /// Number of recorded step pulses.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Net travel implied by the recorded pulses (+1 forward, -1 reverse).
    pub fn net_steps(&self) -> i64 {
        self.steps
            .iter()
            .map(|s| if s.forward { 1i64 } else { -1 })
            .sum()
    }

    /// Smallest interval between consecutive pulses, if two exist [µs].
    pub fn min_interval_us(&self) -> Option<u64> {
        self.steps
            .windows(2)
            .map(|w| w[1].at_us - w[0].at_us)
            .min()
    }
}

/// Driver-pin recorder for one simulated axis.
#[derive(Debug, Clone)]
pub struct RecordingPins {
    clock: SimClock,
    log: Arc<Mutex<PinLog>>,
    step_asserted: bool,
}

impl RecordingPins {
    /// Create a recorder stamping events with the given clock.
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            log: Arc::new(Mutex::new(PinLog::default())),
            step_asserted: false,
        }
    }

    /// Shared handle onto the recorded pin log.
    pub fn log(&self) -> Arc<Mutex<PinLog>> {
        Arc::clone(&self.log)
    }
}

impl DriverPins for RecordingPins {
    fn write_step(&mut self, asserted: bool) {
        let rising = asserted && !self.step_asserted;
        self.step_asserted = asserted;
        if rising {
            let mut log = self.log.lock().unwrap();
            let forward = log.dir_forward;
            log.steps.push(StepEvent {
                at_us: self.clock.now_us(),
                forward,
            });
        }
    }

    fn write_dir(&mut self, forward: bool) {
        self.log.lock().unwrap().dir_forward = forward;
    }

    fn write_enable(&mut self, on: bool) {
        let mut log = self.log.lock().unwrap();
        if log.enabled != on || log.enable_changes.is_empty() {
            let at = self.clock.now_us();
            log.enable_changes.push((at, on));
            log.enabled = on;
        }
    }
}

/// Feedable quadrature counter with hardware-style saturation.
#[derive(Debug, Clone)]
pub struct SimCounter {
    value: Arc<AtomicI32>,
    limit: i32,
}

impl SimCounter {
    /// Create a counter saturating at ±`limit`.
    pub fn new(limit: i32) -> Self {
        Self {
            value: Arc::new(AtomicI32::new(0)),
            limit,
        }
    }

    /// Feed signed encoder pulses, clamping at the saturation limits.
    pub fn feed(&self, delta: i32) {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let next = (current + delta).clamp(-self.limit, self.limit);
            match self.value.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl PulseCounter for SimCounter {
    #[inline]
    fn read(&mut self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    fn clear(&mut self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_advances() {
        let clock = SimClock::new();
        assert_eq!(clock.now_us(), 0);
        clock.advance_us(250);
        assert_eq!(clock.now_us(), 250);
        clock.delay_ms(1);
        assert_eq!(clock.now_us(), 1_250);
    }

    #[test]
    fn recorder_captures_rising_edges_only() {
        let clock = SimClock::new();
        let mut pins = RecordingPins::new(clock.clone());
        pins.write_dir(true);
        pins.write_step(true);
        pins.write_step(false);
        clock.advance_us(100);
        pins.write_step(true);
        pins.write_step(true); // held asserted, no second edge
        pins.write_step(false);

        let log = pins.log();
        let log = log.lock().unwrap();
        assert_eq!(log.step_count(), 2);
        assert_eq!(log.steps[1].at_us, 100);
        assert_eq!(log.net_steps(), 2);
    }

    #[test]
    fn recorder_tracks_direction_per_pulse() {
        let clock = SimClock::new();
        let mut pins = RecordingPins::new(clock.clone());
        pins.write_dir(true);
        pins.write_step(true);
        pins.write_step(false);
        pins.write_dir(false);
        pins.write_step(true);
        pins.write_step(false);

        let log = pins.log();
        let log = log.lock().unwrap();
        assert!(log.steps[0].forward);
        assert!(!log.steps[1].forward);
        assert_eq!(log.net_steps(), 0);
    }

    #[test]
    fn counter_saturates_at_limit() {
        let mut counter = SimCounter::new(100);
        counter.feed(250);
        assert_eq!(counter.read(), 100);
        counter.feed(-300);
        assert_eq!(counter.read(), -100);
        counter.clear();
        assert_eq!(counter.read(), 0);
    }
}
