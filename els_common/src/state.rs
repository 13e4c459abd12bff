//! Operating modes, axis identifiers and safety reasons.
//!
//! All enums use `#[repr(u8)]` with explicit discriminants so they can
//! be persisted, latched in atomics and restored without ambiguity.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Lathe operating mode.
///
/// Selects how the motion coordinator derives axis targets each tick.
/// Synchronous modes follow the spindle encoder; the rest drive axes on
/// their own timebase or from external commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    /// Base synchronous mode: Z follows the spindle (threading/feeding).
    Normal = 0,
    /// Z advances at a constant rate independent of the spindle.
    Async = 1,
    /// Z and X follow the spindle in a fixed ratio (conical turning).
    Cone = 2,
    /// Multi-pass longitudinal turning between stops.
    Turn = 3,
    /// Multi-pass facing (Turn with Z and X roles swapped).
    Face = 4,
    /// Multi-pass grooving: X-only infeed.
    Cut = 5,
    /// Multi-pass threading: like Turn but phase-locked across passes.
    Thread = 6,
    /// Z and X swept along a quarter ellipse as the spindle advances.
    Ellipse = 7,
    /// Targets fed from the external G-code parser.
    GCode = 8,
    /// Indexed rotations of the A1 axis; Z and X idle.
    A1 = 9,
}

impl Mode {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Async),
            2 => Some(Self::Cone),
            3 => Some(Self::Turn),
            4 => Some(Self::Face),
            5 => Some(Self::Cut),
            6 => Some(Self::Thread),
            7 => Some(Self::Ellipse),
            8 => Some(Self::GCode),
            9 => Some(Self::A1),
            _ => None,
        }
    }

    /// Whether this mode runs the shared multi-pass sequencer.
    #[inline]
    pub const fn is_multi_pass(&self) -> bool {
        matches!(
            self,
            Self::Turn | Self::Face | Self::Cut | Self::Thread | Self::Ellipse
        )
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::Normal
    }
}

/// Reason for a latched emergency stop.
///
/// Discriminants start at 1; zero is reserved for "no stop" in the
/// atomic latch encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EstopReason {
    /// A key was held down during boot.
    KeyStuckAtBoot = 1,
    /// Runtime position left the mechanical travel envelope.
    TravelEnvelope = 2,
    /// Setting the origin failed mid-operation.
    OriginSetFailed = 3,
    /// Enable/disable request contradicted the observed state.
    OnOffInconsistency = 4,
    /// Power-off was pressed while an axis was moved manually.
    OffDuringManualMove = 5,
}

impl EstopReason {
    /// Convert from raw `u8`. Returns `None` for zero or invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::KeyStuckAtBoot),
            2 => Some(Self::TravelEnvelope),
            3 => Some(Self::OriginSetFailed),
            4 => Some(Self::OnOffInconsistency),
            5 => Some(Self::OffDuringManualMove),
            _ => None,
        }
    }
}

/// Identifies one of the three motion axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AxisId {
    /// Longitudinal carriage travel.
    Z = 0,
    /// Cross-slide travel.
    X = 1,
    /// Optional rotary axis (indexing head).
    A1 = 2,
}

impl AxisId {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Z),
            1 => Some(Self::X),
            2 => Some(Self::A1),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-axis diagnostic status word for the query surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AxisStatusFlags: u8 {
        /// Driver enable line asserted.
        const ENABLED          = 0x01;
        /// Steps pending or a step emitted within the grace window.
        const MOVING           = 0x02;
        /// Current target is continuous (synchronous following).
        const CONTINUOUS       = 0x04;
        /// Tool position sits at the left stop.
        const AT_LEFT_STOP     = 0x08;
        /// Tool position sits at the right stop.
        const AT_RIGHT_STOP    = 0x10;
        /// Axis switched off by the operator.
        const DISABLED_BY_USER = 0x20;
        /// Axis currently driven by manual input.
        const MANUAL           = 0x40;
    }
}

impl Default for AxisStatusFlags {
    fn default() -> Self {
        Self::empty()
    }
}
