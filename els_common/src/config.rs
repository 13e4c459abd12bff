//! Machine configuration: axes, encoder, TOML loading.
//!
//! Configuration is fixed at construction time. `validate()` runs the
//! semantic checks before any hardware object is built; derived
//! quantities (estop travel, backlash in steps) are computed here so
//! the motion crates only ever see steps.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::units;

/// Error type for configuration loading and validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Static configuration of one stepper axis.
///
/// # TOML Example
///
/// ```toml
/// [z]
/// name = "Z"
/// active = true
/// rotational = false
/// motor_steps_per_rev = 1600.0
/// screw_pitch_du = 20000.0
/// start_speed = 700
/// manual_max_speed = 8000
/// acceleration = 20000
/// invert_direction = false
/// needs_rest = false
/// max_travel_mm = 300
/// backlash_du = 65
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Axis designator shown in diagnostics ('Z', 'X', 'C').
    pub name: char,
    /// Whether the axis is present in this machine.
    pub active: bool,
    /// Rotary axes count in 1/10000 degree instead of deci-microns.
    pub rotational: bool,
    /// Motor steps per revolution, microstepping included.
    pub motor_steps_per_rev: f64,
    /// Lead screw pitch in deci-microns per revolution. For rotary axes
    /// this is the angular units advanced per motor revolution.
    pub screw_pitch_du: f64,
    /// Speed of the first step after rest [steps/s].
    pub start_speed: i64,
    /// Speed ceiling for manual moves [steps/s].
    pub manual_max_speed: i64,
    /// Acceleration and deceleration rate [steps/s²].
    pub acceleration: i64,
    /// Invert the direction line at the GPIO write.
    pub invert_direction: bool,
    /// Driver must be de-energized when no consumer holds an enable
    /// reference (open-loop drivers that overheat at rest).
    pub needs_rest: bool,
    /// Mechanical travel limit [mm]; bounds any single command.
    pub max_travel_mm: i64,
    /// Mechanical backlash of the drive train [du].
    pub backlash_du: i64,
}

impl AxisConfig {
    /// Maximum single-command travel in steps, derived from the
    /// mechanical travel limit.
    #[inline]
    pub fn estop_steps(&self) -> i64 {
        (self.max_travel_mm as f64 * units::DU_PER_MM as f64 / self.screw_pitch_du
            * self.motor_steps_per_rev) as i64
    }

    /// Mechanical backlash in steps.
    #[inline]
    pub fn backlash_steps(&self) -> i64 {
        (self.backlash_du as f64 * self.motor_steps_per_rev / self.screw_pitch_du) as i64
    }

    /// Convert a tool-frame step count to deci-microns.
    #[inline]
    pub fn steps_to_du(&self, steps: i64) -> i64 {
        units::du_from_steps(steps, self.motor_steps_per_rev, self.screw_pitch_du)
    }

    /// Convert deci-microns to steps on this axis's lead.
    #[inline]
    pub fn du_to_steps(&self, du: i64) -> i64 {
        units::steps_from_du(du, self.motor_steps_per_rev, self.screw_pitch_du)
    }

    /// Validate the axis configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when an active axis has a
    /// non-positive lead, inverted speed ordering, or zero acceleration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.active {
            return Ok(());
        }
        if self.motor_steps_per_rev <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: motor_steps_per_rev must be positive",
                self.name
            )));
        }
        if self.screw_pitch_du <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: screw_pitch_du must be positive",
                self.name
            )));
        }
        if self.start_speed <= 0 || self.manual_max_speed < self.start_speed {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: speeds must satisfy 0 < start_speed <= manual_max_speed",
                self.name
            )));
        }
        if self.acceleration <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: acceleration must be positive",
                self.name
            )));
        }
        if self.max_travel_mm <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: max_travel_mm must be positive",
                self.name
            )));
        }
        if self.backlash_du < 0 {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: backlash_du cannot be negative",
                self.name
            )));
        }
        Ok(())
    }
}

/// Static configuration of the spindle encoder and its hardware counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Encoder lines per revolution.
    pub ppr: i64,
    /// Quadrature multiplier of the counter (normally 4).
    pub quadrature: i64,
    /// Counter filter window; pulses shorter than this are noise.
    pub filter_value: u16,
    /// Symmetric saturation limit of the hardware counter.
    pub counter_limit: i32,
    /// Counter magnitude at which a clear-and-resync is performed.
    pub counter_clear_threshold: i32,
    /// Backlash of the encoder coupling in counted pulses.
    pub backlash_pulses: i64,
}

impl EncoderConfig {
    /// Counted pulses per spindle revolution.
    #[inline]
    pub fn pulses_per_rev(&self) -> i64 {
        self.ppr * self.quadrature
    }

    /// Validate the encoder configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ppr <= 0 || self.quadrature <= 0 {
            return Err(ConfigError::ValidationError(
                "encoder: ppr and quadrature must be positive".to_string(),
            ));
        }
        if self.counter_clear_threshold <= 0
            || self.counter_clear_threshold > self.counter_limit
        {
            return Err(ConfigError::ValidationError(
                "encoder: clear threshold must be positive and below the counter limit"
                    .to_string(),
            ));
        }
        if (self.counter_clear_threshold as i64) < self.pulses_per_rev() {
            return Err(ConfigError::ValidationError(
                "encoder: clear threshold must cover at least one revolution".to_string(),
            ));
        }
        if self.backlash_pulses < 0 || self.backlash_pulses >= self.pulses_per_rev() {
            return Err(ConfigError::ValidationError(
                "encoder: backlash must be within one revolution".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ppr: crate::consts::ENCODER_PPR,
            quadrature: crate::consts::ENCODER_QUADRATURE,
            filter_value: 1023,
            counter_limit: crate::consts::COUNTER_LIMIT,
            counter_clear_threshold: crate::consts::COUNTER_CLEAR_THRESHOLD,
            backlash_pulses: crate::consts::ENCODER_BACKLASH_PULSES,
        }
    }
}

/// Full machine configuration: three axes plus the spindle encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Longitudinal axis.
    pub z: AxisConfig,
    /// Cross-slide axis.
    pub x: AxisConfig,
    /// Optional rotary axis.
    pub a1: AxisConfig,
    /// Spindle encoder.
    #[serde(default)]
    pub encoder: EncoderConfig,
}

impl MachineConfig {
    /// Validate the whole machine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first axis or encoder validation failure, or a
    /// `ValidationError` when the Z axis is inactive (the machine is
    /// unusable without its primary axis).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.z.active {
            return Err(ConfigError::ValidationError(
                "axis Z must be active".to_string(),
            ));
        }
        self.z.validate()?;
        self.x.validate()?;
        self.a1.validate()?;
        self.encoder.validate()
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation so any deserializable struct can use the loader.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn z_axis() -> AxisConfig {
        AxisConfig {
            name: 'Z',
            active: true,
            rotational: false,
            motor_steps_per_rev: 1_600.0,
            screw_pitch_du: 20_000.0,
            start_speed: 700,
            manual_max_speed: 8_000,
            acceleration: 20_000,
            invert_direction: false,
            needs_rest: false,
            max_travel_mm: 300,
            backlash_du: 65,
        }
    }

    #[test]
    fn derived_quantities() {
        let cfg = z_axis();
        // 300 mm on a 2 mm screw at 1600 steps/rev.
        assert_eq!(cfg.estop_steps(), 240_000);
        // 65 du of backlash is 5.2 steps, truncated like the firmware did.
        assert_eq!(cfg.backlash_steps(), 5);
    }

    #[test]
    fn du_round_trip_through_axis() {
        let cfg = z_axis();
        assert_eq!(cfg.du_to_steps(10_000), 800);
        assert_eq!(cfg.steps_to_du(800), 10_000);
    }

    #[test]
    fn inactive_axis_skips_validation() {
        let mut cfg = z_axis();
        cfg.active = false;
        cfg.acceleration = 0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_speed_ordering_rejected() {
        let mut cfg = z_axis();
        cfg.manual_max_speed = 500;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn encoder_defaults_validate() {
        assert!(EncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn encoder_backlash_bound() {
        let cfg = EncoderConfig {
            backlash_pulses: 5_000,
            ..EncoderConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn machine_requires_active_z() {
        let mut z = z_axis();
        z.active = false;
        let machine = MachineConfig {
            z,
            x: z_axis(),
            a1: z_axis(),
            encoder: EncoderConfig::default(),
        };
        assert!(machine.validate().is_err());
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[z]
name = "Z"
active = true
rotational = false
motor_steps_per_rev = 1600.0
screw_pitch_du = 20000.0
start_speed = 700
manual_max_speed = 8000
acceleration = 20000
invert_direction = false
needs_rest = false
max_travel_mm = 300
backlash_du = 65

[x]
name = "X"
active = true
rotational = false
motor_steps_per_rev = 800.0
screw_pitch_du = 10000.0
start_speed = 500
manual_max_speed = 5000
acceleration = 15000
invert_direction = true
needs_rest = true
max_travel_mm = 100
backlash_du = 130

[a1]
name = "C"
active = false
rotational = true
motor_steps_per_rev = 3200.0
screw_pitch_du = 3600000.0
start_speed = 400
manual_max_speed = 3000
acceleration = 10000
invert_direction = false
needs_rest = true
max_travel_mm = 1
backlash_du = 0
"#
        )
        .unwrap();
        file.flush().unwrap();

        let machine = MachineConfig::load(file.path()).unwrap();
        assert!(machine.validate().is_ok());
        assert_eq!(machine.z.name, 'Z');
        assert_eq!(machine.x.backlash_steps(), 10);
        assert!(machine.x.invert_direction);
        // Encoder table omitted: defaults apply.
        assert_eq!(machine.encoder.pulses_per_rev(), 2_400);
    }

    #[test]
    fn load_missing_file() {
        let result = MachineConfig::load(Path::new("/nonexistent/els.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn load_bad_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[").unwrap();
        let result = MachineConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
