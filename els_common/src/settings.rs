//! Serializable snapshot of operator-visible state.
//!
//! The core does not persist anything itself; the external settings
//! collaborator serializes this snapshot on change and hands it back on
//! boot. The schema version gates restoration: a mismatched snapshot is
//! discarded rather than partially applied.

use serde::{Deserialize, Serialize};

use crate::consts::SETTINGS_SCHEMA_VERSION;
use crate::state::Mode;

/// Persisted per-axis state: origin and soft stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Cumulative offset of the operator origin from absolute zero [steps].
    pub origin_offset: i64,
    /// Left soft stop, if set [steps].
    pub left_stop: Option<i64>,
    /// Right soft stop, if set [steps].
    pub right_stop: Option<i64>,
}

/// Everything the external settings store needs to restore a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    /// Schema version of this snapshot.
    pub schema_version: u32,
    /// Selected operating mode.
    pub mode: Mode,
    /// Signed pitch in deci-microns per revolution.
    pub pitch_du: i64,
    /// Number of thread starts.
    pub starts: i32,
    /// Z-to-X ratio for cone mode.
    pub cone_ratio: f64,
    /// Number of passes for multi-pass modes.
    pub turn_passes: i32,
    /// Auxiliary axis direction (external vs internal work).
    pub aux_direction_forward: bool,
    /// Z axis origin and stops.
    pub z: AxisSettings,
    /// X axis origin and stops.
    pub x: AxisSettings,
    /// A1 axis origin and stops.
    pub a1: AxisSettings,
}

impl SettingsSnapshot {
    /// Whether this snapshot was written by the current schema.
    #[inline]
    pub fn is_current_schema(&self) -> bool {
        self.schema_version == SETTINGS_SCHEMA_VERSION
    }
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SETTINGS_SCHEMA_VERSION,
            mode: Mode::Normal,
            pitch_du: 0,
            starts: 1,
            cone_ratio: 1.0,
            turn_passes: 3,
            aux_direction_forward: true,
            z: AxisSettings::default(),
            x: AxisSettings::default(),
            a1: AxisSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_current_schema() {
        assert!(SettingsSnapshot::default().is_current_schema());
    }

    #[test]
    fn toml_round_trip() {
        let snapshot = SettingsSnapshot {
            mode: Mode::Thread,
            pitch_du: -15_000,
            starts: 2,
            z: AxisSettings {
                origin_offset: 1_234,
                left_stop: Some(5_000),
                right_stop: None,
            },
            ..SettingsSnapshot::default()
        };

        let text = toml::to_string(&snapshot).unwrap();
        let back: SettingsSnapshot = toml::from_str(&text).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn stale_schema_detected() {
        let snapshot = SettingsSnapshot {
            schema_version: SETTINGS_SCHEMA_VERSION - 1,
            ..SettingsSnapshot::default()
        };
        assert!(!snapshot.is_current_schema());
    }
}
