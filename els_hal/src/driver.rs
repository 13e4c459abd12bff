//! Stepper driver line seam.

/// The three GPIO lines of one stepper driver.
///
/// Each implementor is owned exclusively by its axis engine; no other
/// code touches these lines. The engine handles pulse width, direction
/// setup time and the per-axis direction inversion; an implementor
/// only writes levels.
pub trait DriverPins {
    /// Drive the step line. `asserted` is the active (pulse) level;
    /// the implementor maps it onto the electrical polarity.
    fn write_step(&mut self, asserted: bool);

    /// Drive the direction line. `forward` is the logical direction
    /// after any configured inversion has been applied by the engine.
    fn write_dir(&mut self, forward: bool);

    /// Drive the enable line.
    fn write_enable(&mut self, on: bool);
}
