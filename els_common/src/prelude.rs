//! Prelude module for common re-exports.
//!
//! `use els_common::prelude::*;` brings in the types practically every
//! consumer of the workspace needs, without listing individual paths.

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{CoreError, CoreResult};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{AxisConfig, ConfigError, ConfigLoader, EncoderConfig, MachineConfig};

// ─── State ──────────────────────────────────────────────────────────
pub use crate::state::{AxisId, AxisStatusFlags, EstopReason, Mode};

// ─── Settings ───────────────────────────────────────────────────────
pub use crate::settings::{AxisSettings, SettingsSnapshot};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{DUPR_MAX, MOTION_CYCLE_US, PASSES_MAX, PULSES_PER_REV, STARTS_MAX};
