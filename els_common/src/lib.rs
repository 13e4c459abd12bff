//! ELS Common Library
//!
//! Shared foundation for the ELS (Electronic Lead Screw) workspace crates.
//! Provides the system-wide constants, fixed-point unit conversions,
//! configuration loading, error types, operating-mode and safety enums,
//! and the persisted-settings snapshot.
//!
//! # Module Structure
//!
//! - [`consts`] - Numeric limits and timing constants
//! - [`units`] - Deci-micron / step conversion helpers
//! - [`config`] - Axis, encoder and machine configuration with TOML loading
//! - [`error`] - The workspace-wide error type
//! - [`state`] - Operating modes, axis identifiers, status flags
//! - [`settings`] - Serializable snapshot of operator-visible state
//! - [`prelude`] - Common re-exports for convenience

pub mod config;
pub mod consts;
pub mod error;
pub mod prelude;
pub mod settings;
pub mod state;
pub mod units;
