//! Position arithmetic shared by the operating modes.
//!
//! Pure functions only: the coordinator owns the state and the axes,
//! these helpers own the math. Axis targets derived from the spindle
//! scale by `steps_per_rev · pitch · starts / pulses_per_rev` through
//! the axis lead; the conversions truncate toward zero the way the
//! step accounting expects.

pub(crate) mod pass;

use crate::axis::AxisParams;

/// Axis target (tool-frame steps) for a given spindle position.
pub(crate) fn axis_target_from_spindle(
    params: &AxisParams,
    spindle_pos: i64,
    pitch_du: i64,
    starts: i32,
    pulses_per_rev: i64,
) -> i64 {
    (spindle_pos as f64 * params.motor_steps_per_rev / params.screw_pitch_du
        / pulses_per_rev as f64
        * pitch_du as f64
        * starts as f64) as i64
}

/// Spindle position (pulses) equivalent to an axis position. Inverse of
/// [`axis_target_from_spindle`]; `pitch_du` must be non-zero.
pub(crate) fn spindle_from_axis_pos(
    params: &AxisParams,
    axis_pos: i64,
    pitch_du: i64,
    starts: i32,
    pulses_per_rev: i64,
) -> i64 {
    (axis_pos as f64 * params.screw_pitch_du / params.motor_steps_per_rev
        * pulses_per_rev as f64
        / (pitch_du as f64 * starts as f64)) as i64
}

/// Clamp a target into the soft-limit window. Missing stops do not
/// constrain.
pub(crate) fn clamp_to_stops(target: i64, left: Option<i64>, right: Option<i64>) -> i64 {
    let mut clamped = target;
    if let Some(right) = right {
        if clamped < right {
            clamped = right;
        }
    }
    if let Some(left) = left {
        if clamped > left {
            clamped = left;
        }
    }
    clamped
}

/// Cross-slide target coupled to the Z position in cone mode.
///
/// Half the cone ratio of the Z travel, signed by the auxiliary
/// direction, mapped through the X lead.
pub(crate) fn cone_coupled_target(
    x_params: &AxisParams,
    z_travel_du: i64,
    cone_ratio: f64,
    aux_forward: bool,
) -> i64 {
    let aux_sign = if aux_forward { 1.0 } else { -1.0 };
    let x_du = -cone_ratio / 2.0 * z_travel_du as f64 * aux_sign;
    x_params.du_to_steps(x_du as i64)
}

/// Infeed depth fraction of a quarter ellipse at sweep parameter
/// `u ∈ [0, 1]`: zero depth at the start, full depth at the end, with
/// the elliptical shoulder in between.
pub(crate) fn ellipse_infeed_fraction(u: f64) -> f64 {
    let u = u.clamp(0.0, 1.0);
    1.0 - (1.0 - u * u).sqrt()
}
