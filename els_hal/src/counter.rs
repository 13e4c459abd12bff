//! Quadrature pulse counter seam.

/// Hardware quadrature counter of the spindle encoder.
///
/// The counter accumulates signed pulses in hardware; the tracker reads
/// it relatively and clears it near saturation. Clearing between a read
/// and the next pulse can lose at most one pulse, which the tracker
/// accepts.
pub trait PulseCounter {
    /// Current signed counter value.
    fn read(&mut self) -> i32;

    /// Reset the counter to zero.
    fn clear(&mut self);
}
