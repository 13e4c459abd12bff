//! Multi-pass operation sequencing.
//!
//! Turn, Face, Thread, Cut and Ellipse all run the same pass machine:
//! position the infeed axis outside the work, bring the main axis to
//! the start stop, step in by this pass's depth fraction, engage the
//! cut, retract, return, repeat. Cut is the degenerate case with no
//! main axis; its infeed is the cut.
//!
//! The machine itself is pure data; the coordinator executes it
//! against the axes each tick.

use els_common::state::Mode;

/// One step of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStep {
    /// Rapid the infeed axis to the outside stop.
    RapidInfeedOut,
    /// Rapid the main axis to the start stop.
    RapidMainToStart,
    /// Infeed by this pass's depth fraction.
    StepIn,
    /// Synchronous advance of the main axis to the far stop.
    Engage,
    /// Retract the infeed axis to the outside stop.
    Retract,
    /// Return the main axis to the start stop.
    Return,
}

impl PassStep {
    /// First step of a pass for the given mode.
    pub fn first(_mode: Mode) -> Self {
        Self::RapidInfeedOut
    }

    /// Next step within the same pass; `None` when the pass is done.
    pub fn next(self, mode: Mode) -> Option<Self> {
        match (mode, self) {
            // Grooving has no main-axis motion: the infeed is the cut.
            (Mode::Cut, Self::RapidInfeedOut) => Some(Self::StepIn),
            (Mode::Cut, Self::StepIn) => Some(Self::Retract),
            (Mode::Cut, Self::Retract) => None,

            // The elliptical sweep starts at zero depth; the infeed is
            // coupled to the sweep itself, so there is no step-in.
            (Mode::Ellipse, Self::RapidMainToStart) => Some(Self::Engage),

            (_, Self::RapidInfeedOut) => Some(Self::RapidMainToStart),
            (_, Self::RapidMainToStart) => Some(Self::StepIn),
            (_, Self::StepIn) => Some(Self::Engage),
            (_, Self::Engage) => Some(Self::Retract),
            (_, Self::Retract) => Some(Self::Return),
            (_, Self::Return) => None,
        }
    }
}

/// Scratch state of the running multi-pass operation.
#[derive(Debug, Clone, Copy)]
pub struct OpState {
    /// Completed passes.
    pub index: i32,
    /// Current step within the pass.
    pub step: PassStep,
    /// Operator requested a skip to the next pass.
    pub advance: bool,
    /// Pitch at the moment the operation was enabled.
    pub start_pitch: i64,
    /// Sign of the pitch at enable; a flipped sign aborts the mode.
    pub pitch_sign: i64,
    /// Whether the Engage step has armed its synchronization.
    pub engaged: bool,
}

impl OpState {
    /// Fresh operation state for an enable with the given pitch.
    pub fn reset(mode: Mode, pitch_du: i64) -> Self {
        Self {
            index: 0,
            step: PassStep::first(mode),
            advance: false,
            start_pitch: pitch_du,
            pitch_sign: if pitch_du >= 0 { 1 } else { -1 },
            engaged: false,
        }
    }

    /// Move to the next step, rolling over into the next pass.
    pub fn advance_step(&mut self, mode: Mode) {
        self.engaged = false;
        match self.step.next(mode) {
            Some(step) => self.step = step,
            None => {
                self.index += 1;
                self.step = PassStep::first(mode);
            }
        }
    }
}

/// A fully set soft-limit window (`right < left`).
#[derive(Debug, Clone, Copy)]
pub struct StopWindow {
    /// Numerically larger bound [steps].
    pub left: i64,
    /// Numerically smaller bound [steps].
    pub right: i64,
}

impl StopWindow {
    /// Window width [steps].
    #[inline]
    pub fn span(&self) -> i64 {
        self.left - self.right
    }
}

/// Outside stop of the infeed axis: where the tool clears the work.
/// External work retracts toward the left stop, internal toward the
/// right.
#[inline]
pub fn outside_stop(window: &StopWindow, aux_forward: bool) -> i64 {
    if aux_forward {
        window.left
    } else {
        window.right
    }
}

/// Inside stop of the infeed axis: full cut depth.
#[inline]
pub fn inside_stop(window: &StopWindow, aux_forward: bool) -> i64 {
    if aux_forward {
        window.right
    } else {
        window.left
    }
}

/// Infeed target for pass `pass_index` of `passes`: an even fraction
/// of the full depth per pass, measured from the outside stop.
pub fn step_in_target(
    window: &StopWindow,
    aux_forward: bool,
    pass_index: i32,
    passes: i32,
) -> i64 {
    let outside = outside_stop(window, aux_forward);
    let inside = inside_stop(window, aux_forward);
    let depth = inside - outside;
    outside + (depth as f64 * (pass_index + 1) as f64 / passes as f64) as i64
}

/// Start stop of the main axis: the end the feed departs from. A
/// positive pitch feeds from the right stop toward the left.
#[inline]
pub fn start_stop(window: &StopWindow, pitch_sign: i64) -> i64 {
    if pitch_sign >= 0 {
        window.right
    } else {
        window.left
    }
}

/// Far stop of the main axis: where the synchronous feed ends.
#[inline]
pub fn far_stop(window: &StopWindow, pitch_sign: i64) -> i64 {
    if pitch_sign >= 0 {
        window.left
    } else {
        window.right
    }
}
