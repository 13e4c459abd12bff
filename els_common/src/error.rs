//! Workspace-wide error type.
//!
//! The core recovers nothing silently: every rejected command returns a
//! discriminated failure so the caller can surface a message and decide
//! whether to retry.

use thiserror::Error;

use crate::state::EstopReason;

/// Result alias used across the workspace.
pub type CoreResult<T> = Result<T, CoreError>;

/// All failure kinds surfaced by the motion core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoreError {
    /// An out-of-range parameter; state is unchanged.
    #[error("invalid {what}: {value}")]
    InvalidParameter {
        /// Name of the rejected parameter.
        what: &'static str,
        /// The offending value.
        value: i64,
    },

    /// Commanded travel exceeds the mechanical envelope; rejected, not clamped.
    #[error("axis {axis}: travel of {requested_steps} steps exceeds limit of {limit_steps}")]
    TravelExceeded {
        /// Axis designator.
        axis: char,
        /// Requested travel in steps.
        requested_steps: i64,
        /// Maximum single-command travel in steps.
        limit_steps: i64,
    },

    /// A guarded region could not be acquired in time; retry later.
    #[error("{what} busy, command dropped")]
    Busy {
        /// The contended resource.
        what: &'static str,
    },

    /// Mode preconditions not met (e.g. stops missing); enable refused.
    #[error("preconditions not met: {reason}")]
    Preconditions {
        /// Human-readable reason for the refusal.
        reason: &'static str,
    },

    /// The emergency-stop latch is (or has just been) tripped.
    #[error("emergency stop latched: {0:?}")]
    EmergencyStop(EstopReason),
}
