//! ELS Motion Core
//!
//! Real-time motion subsystem of the Electronic Lead Screw controller:
//! a spindle encoder tracker, one stepper engine per axis, and the
//! coordinator that composes them into the lathe operating modes
//! (threading, turning, facing, grooving, conical and elliptical
//! turning, indexing, G-code playback).
//!
//! ## Architecture
//!
//! - [`encoder::EncoderTracker`] - spindle position and RPM from the
//!   hardware quadrature counter, with encoder-backlash compensation.
//! - [`axis::AxisEngine`] - microsecond-timed step pulses toward a
//!   moving or fixed target under trapezoidal acceleration, mechanical
//!   backlash compensation, soft limits and reference-counted enable.
//! - [`coordinator::MotionCoordinator`] - per-tick mode dispatch over
//!   one shared spindle reference and three axes, with the command and
//!   query surface the external collaborators consume.
//! - [`safety::EstopLatch`] - one-shot latched emergency stop.
//!
//! ## Concurrency
//!
//! The motion task calls [`coordinator::MotionCoordinator::tick`] on a
//! dedicated core; input, display and G-code tasks use the command
//! surface, which acquires mutexes with a bounded timeout and returns
//! `Busy` instead of ever blocking the tick. Hardware is reached only
//! through the `els_hal` trait seams, so the whole crate runs against
//! simulated pins and counters in tests.

pub mod axis;
pub mod coordinator;
pub mod cycle;
pub mod encoder;
mod modes;
pub mod safety;

pub use axis::{AxisEngine, AxisParams, AxisSnapshot};
pub use coordinator::{CoordinatorStatus, MotionCoordinator};
pub use cycle::CycleStats;
pub use encoder::EncoderTracker;
pub use safety::EstopLatch;
