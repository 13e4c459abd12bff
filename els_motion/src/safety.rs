//! Emergency-stop latch.
//!
//! A one-shot latch: the first trip reason wins and sticks until an
//! explicit recovery that names it. The latch is a single atomic so
//! the motion tick can poll it without taking any mutex.

use std::sync::atomic::{AtomicU8, Ordering};

use els_common::error::{CoreError, CoreResult};
use els_common::state::EstopReason;
use tracing::{error, info};

/// Latched emergency-stop state shared across tasks.
///
/// Zero encodes "not tripped"; any other value is the `EstopReason`
/// discriminant of the first trip.
#[derive(Debug, Default)]
pub struct EstopLatch {
    state: AtomicU8,
}

impl EstopLatch {
    /// Create an untripped latch.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    /// Trip the latch. The first reason wins; later trips are ignored.
    /// Returns whether this call was the one that latched.
    pub fn trip(&self, reason: EstopReason) -> bool {
        let latched = self
            .state
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if latched {
            error!(?reason, "emergency stop latched");
        }
        latched
    }

    /// Whether the latch is tripped.
    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }

    /// The latched reason, if any.
    #[inline]
    pub fn reason(&self) -> Option<EstopReason> {
        EstopReason::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Clear the latch. Recovery must acknowledge the specific reason
    /// that tripped it; anything else is rejected with the latched
    /// reason so the caller can surface it.
    pub fn recover(&self, acknowledged: EstopReason) -> CoreResult<()> {
        match self.state.compare_exchange(
            acknowledged as u8,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!(reason = ?acknowledged, "emergency stop recovered");
                Ok(())
            }
            Err(current) => match EstopReason::from_u8(current) {
                Some(actual) => Err(CoreError::EmergencyStop(actual)),
                None => Err(CoreError::InvalidParameter {
                    what: "estop_reason",
                    value: acknowledged as i64,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trip_wins() {
        let latch = EstopLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.trip(EstopReason::TravelEnvelope));
        assert!(!latch.trip(EstopReason::KeyStuckAtBoot));
        assert_eq!(latch.reason(), Some(EstopReason::TravelEnvelope));
    }

    #[test]
    fn recovery_requires_matching_reason() {
        let latch = EstopLatch::new();
        latch.trip(EstopReason::OffDuringManualMove);

        let err = latch.recover(EstopReason::TravelEnvelope).unwrap_err();
        assert_eq!(
            err,
            CoreError::EmergencyStop(EstopReason::OffDuringManualMove)
        );
        assert!(latch.is_tripped());

        latch.recover(EstopReason::OffDuringManualMove).unwrap();
        assert!(!latch.is_tripped());
    }

    #[test]
    fn recovering_untripped_latch_fails() {
        let latch = EstopLatch::new();
        assert!(matches!(
            latch.recover(EstopReason::KeyStuckAtBoot),
            Err(CoreError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn latch_can_trip_again_after_recovery() {
        let latch = EstopLatch::new();
        latch.trip(EstopReason::KeyStuckAtBoot);
        latch.recover(EstopReason::KeyStuckAtBoot).unwrap();
        assert!(latch.trip(EstopReason::TravelEnvelope));
    }
}
