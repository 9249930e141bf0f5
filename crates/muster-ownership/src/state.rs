//! Ownership states, operations, notifications and their transitions

use bitflags::bitflags;
use std::fmt;
use tracing::error;

bitflags! {
    /// Orthogonal boolean flags describing a federate's relation to one
    /// property. A valid state has exactly one of `OWNED`/`UNOWNED` plus the
    /// consistent dependent pairs, see [`OwnershipState::validate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OwnershipState: u32 {
        /// Subscribed and permitted to acquire
        const ABLE_TO_ACQUIRE               = 0x0001;
        /// An acquisition request is in flight
        const ACQUIRING                     = 0x0002;
        /// The acquisition has been submitted to arbitration
        const ACQUISITION_PENDING           = 0x0004;
        /// The owner was asked to release
        const ASKED_TO_RELEASE              = 0x0008;
        /// The owner is negotiating its ownership away
        const DIVESTING                     = 0x0010;
        /// Not published; cannot acquire
        const NOT_ABLE_TO_ACQUIRE           = 0x0020;
        /// No acquisition in flight
        const NOT_ACQUIRING                 = 0x0040;
        /// The owner has no pending release request
        const NOT_ASKED_TO_RELEASE          = 0x0080;
        /// The owner is not divesting
        const NOT_DIVESTING                 = 0x0100;
        /// No if-available intent registered
        const NOT_TRYING_TO_ACQUIRE         = 0x0200;
        /// This federate owns the property
        const OWNED                         = 0x0400;
        /// A cancellation of the in-flight acquisition is pending
        const TRYING_TO_CANCEL_ACQUISITION  = 0x0800;
        /// This federate does not own the property
        const UNOWNED                       = 0x1000;
        /// Will take ownership if it becomes available
        const WILLING_TO_ACQUIRE            = 0x2000;
    }
}

fn validate_xor(
    state: OwnershipState,
    condition: OwnershipState,
    flag1: OwnershipState,
    flag2: OwnershipState,
) -> bool {
    if state.intersects(condition) {
        state.intersects(flag1) != state.intersects(flag2)
    } else {
        !state.intersects(flag1) && !state.intersects(flag2)
    }
}

fn validate_or(
    state: OwnershipState,
    condition: OwnershipState,
    flag1: OwnershipState,
    flag2: OwnershipState,
) -> bool {
    if state.intersects(condition) {
        state.intersects(flag1) || state.intersects(flag2)
    } else {
        true
    }
}

impl OwnershipState {
    /// The resting state of an owner
    pub fn owned() -> Self {
        Self::OWNED | Self::NOT_DIVESTING | Self::NOT_ASKED_TO_RELEASE
    }

    /// The resting state of a publisher that does not own
    pub fn unowned_able_to_acquire() -> Self {
        Self::UNOWNED | Self::ABLE_TO_ACQUIRE | Self::NOT_ACQUIRING | Self::NOT_TRYING_TO_ACQUIRE
    }

    /// The resting state of a pure subscriber
    pub fn unowned_not_able_to_acquire() -> Self {
        Self::UNOWNED | Self::NOT_ABLE_TO_ACQUIRE
    }

    /// Whether the flag combination is internally consistent
    pub fn validate(self) -> bool {
        let s = self;
        s.intersects(Self::OWNED) != s.intersects(Self::UNOWNED)
            && validate_xor(s, Self::OWNED, Self::NOT_DIVESTING, Self::DIVESTING)
            && validate_xor(s, Self::OWNED, Self::NOT_ASKED_TO_RELEASE, Self::ASKED_TO_RELEASE)
            && validate_xor(s, Self::UNOWNED, Self::NOT_ABLE_TO_ACQUIRE, Self::ABLE_TO_ACQUIRE)
            && validate_xor(
                s,
                Self::ABLE_TO_ACQUIRE,
                Self::NOT_ACQUIRING,
                Self::ACQUISITION_PENDING,
            )
            && validate_xor(
                s,
                Self::ABLE_TO_ACQUIRE,
                Self::NOT_TRYING_TO_ACQUIRE,
                Self::WILLING_TO_ACQUIRE,
            )
            && validate_or(
                s,
                Self::ABLE_TO_ACQUIRE,
                Self::NOT_ACQUIRING,
                Self::NOT_TRYING_TO_ACQUIRE,
            )
    }
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OwnershipState, &str); 14] = [
            (OwnershipState::OWNED, "Owned"),
            (OwnershipState::UNOWNED, "Unowned"),
            (OwnershipState::DIVESTING, "Divesting"),
            (OwnershipState::NOT_DIVESTING, "NotDivesting"),
            (OwnershipState::ASKED_TO_RELEASE, "AskedToRelease"),
            (OwnershipState::NOT_ASKED_TO_RELEASE, "NotAskedToRelease"),
            (OwnershipState::ABLE_TO_ACQUIRE, "AbleToAcquire"),
            (OwnershipState::NOT_ABLE_TO_ACQUIRE, "NotAbleToAcquire"),
            (OwnershipState::ACQUISITION_PENDING, "AcquisitionPending"),
            (OwnershipState::NOT_ACQUIRING, "NotAcquiring"),
            (OwnershipState::ACQUIRING, "Acquiring"),
            (
                OwnershipState::TRYING_TO_CANCEL_ACQUISITION,
                "TryingToCancelAcquisition",
            ),
            (OwnershipState::WILLING_TO_ACQUIRE, "WillingToAcquire"),
            (OwnershipState::NOT_TRYING_TO_ACQUIRE, "NotTryingToAcquire"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.intersects(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// Externally initiated ownership operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipOperation {
    /// No operation
    #[default]
    None,
    /// Undo a pending negotiated divestiture
    CancelNegotiatedOwnershipDivestiture,
    /// Undo an in-flight acquisition
    CancelOwnershipAcquisition,
    /// Take ownership unconditionally
    ForcedOwnershipAcquisition,
    /// Strip ownership unconditionally
    ForcedOwnershipDivestiture,
    /// Offer ownership away, waiting for a taker
    NegotiatedOwnershipDivestiture,
    /// Request ownership, asking the owner to release
    OwnershipAcquisition,
    /// Take ownership only if nobody stable owns it
    OwnershipAcquisitionIfAvailable,
    /// Refuse a release request
    OwnershipReleaseFailure,
    /// Grant a release request
    OwnershipReleaseSuccess,
    /// Start publishing (become able to acquire)
    Publish,
    /// Give up ownership with no negotiation
    UnconditionalOwnershipDivestiture,
    /// Stop publishing entirely
    Unpublish,
}

impl fmt::Display for OwnershipOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "-",
            Self::CancelNegotiatedOwnershipDivestiture => "CancelNegotiatedOwnershipDivestiture",
            Self::CancelOwnershipAcquisition => "CancelOwnershipAcquisition",
            Self::ForcedOwnershipAcquisition => "ForcedOwnershipAcquisition",
            Self::ForcedOwnershipDivestiture => "ForcedOwnershipDivestiture",
            Self::NegotiatedOwnershipDivestiture => "NegotiatedOwnershipDivestiture",
            Self::OwnershipAcquisition => "OwnershipAcquisition",
            Self::OwnershipAcquisitionIfAvailable => "OwnershipAcquisitionIfAvailable",
            Self::OwnershipReleaseFailure => "OwnershipReleaseFailure",
            Self::OwnershipReleaseSuccess => "OwnershipReleaseSuccess",
            Self::Publish => "Publish",
            Self::UnconditionalOwnershipDivestiture => "UnconditionalOwnershipDivestiture",
            Self::Unpublish => "Unpublish",
        };
        write!(f, "{}", name)
    }
}

/// Arbitration-produced notification delivered to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipNotification {
    /// No notification
    #[default]
    None,
    /// The requested acquisition cancellation took effect
    ConfirmOwnershipAcquisitionCancellation,
    /// Ownership was forced onto this federate
    ForcedOwnershipAcquisitionNotification,
    /// Ownership was forcibly taken from this federate
    ForcedOwnershipDivestitureNotification,
    /// The acquisition succeeded; this federate now owns
    OwnershipAcquisitionNotification,
    /// The divestiture completed; ownership is gone
    OwnershipDivestitureNotification,
    /// The if-available acquisition found a stable owner
    OwnershipUnavailable,
    /// Somebody is divesting; this federate may assume ownership
    RequestOwnershipAssumption,
    /// Somebody wants this federate to release ownership
    RequestOwnershipRelease,
}

impl fmt::Display for OwnershipNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "-",
            Self::ConfirmOwnershipAcquisitionCancellation => {
                "ConfirmOwnershipAcquisitionCancellation"
            }
            Self::ForcedOwnershipAcquisitionNotification => {
                "ForcedOwnershipAcquisitionNotification"
            }
            Self::ForcedOwnershipDivestitureNotification => {
                "ForcedOwnershipDivestitureNotification"
            }
            Self::OwnershipAcquisitionNotification => "OwnershipAcquisitionNotification",
            Self::OwnershipDivestitureNotification => "OwnershipDivestitureNotification",
            Self::OwnershipUnavailable => "OwnershipUnavailable",
            Self::RequestOwnershipAssumption => "RequestOwnershipAssumption",
            Self::RequestOwnershipRelease => "RequestOwnershipRelease",
        };
        write!(f, "{}", name)
    }
}

/// A state paired with its pending operation (the federate side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateOperation {
    /// Current state
    pub state: OwnershipState,
    /// Operation awaiting arbitration
    pub operation: OwnershipOperation,
}

/// A state paired with its pending notification (the master side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateNotification {
    /// Current state
    pub state: OwnershipState,
    /// Notification awaiting delivery
    pub notification: OwnershipNotification,
}

/// Whether `operation` is legal to initiate from `state`
pub fn is_valid_state_before_operation(
    state: OwnershipState,
    operation: OwnershipOperation,
) -> bool {
    use OwnershipOperation as Op;
    use OwnershipState as S;
    match operation {
        Op::None => true,
        Op::ForcedOwnershipAcquisition => state.intersects(S::UNOWNED),
        Op::ForcedOwnershipDivestiture => state.intersects(S::OWNED),
        Op::CancelNegotiatedOwnershipDivestiture => state.intersects(S::DIVESTING),
        Op::CancelOwnershipAcquisition => state.intersects(S::ACQUIRING),
        Op::NegotiatedOwnershipDivestiture => state.intersects(S::NOT_DIVESTING),
        Op::OwnershipAcquisition => state.intersects(S::NOT_ACQUIRING),
        Op::OwnershipAcquisitionIfAvailable => state.intersects(S::NOT_TRYING_TO_ACQUIRE),
        Op::OwnershipReleaseFailure | Op::OwnershipReleaseSuccess => {
            state.intersects(S::ASKED_TO_RELEASE)
        }
        Op::Publish => state.intersects(S::NOT_ABLE_TO_ACQUIRE),
        Op::UnconditionalOwnershipDivestiture => state.intersects(S::OWNED),
        Op::Unpublish => state.intersects(S::OWNED) || state.intersects(S::ABLE_TO_ACQUIRE),
    }
}

/// Whether `state` is a legal outcome of `operation`
pub fn is_valid_state_after_operation(
    state: OwnershipState,
    operation: OwnershipOperation,
) -> bool {
    use OwnershipOperation as Op;
    use OwnershipState as S;
    match operation {
        Op::None => true,
        Op::ForcedOwnershipAcquisition => state.intersects(S::OWNED),
        Op::ForcedOwnershipDivestiture => state.intersects(S::UNOWNED),
        Op::CancelNegotiatedOwnershipDivestiture => state.intersects(S::NOT_DIVESTING),
        Op::CancelOwnershipAcquisition => state.intersects(S::TRYING_TO_CANCEL_ACQUISITION),
        Op::NegotiatedOwnershipDivestiture => state.intersects(S::DIVESTING),
        Op::OwnershipAcquisition => state.intersects(S::ACQUIRING),
        Op::OwnershipAcquisitionIfAvailable => state.intersects(S::WILLING_TO_ACQUIRE),
        Op::OwnershipReleaseFailure => state.intersects(S::NOT_ASKED_TO_RELEASE),
        Op::OwnershipReleaseSuccess => state.intersects(S::ABLE_TO_ACQUIRE),
        Op::Publish => state.intersects(S::OWNED) || state.intersects(S::ABLE_TO_ACQUIRE),
        Op::UnconditionalOwnershipDivestiture => state.intersects(S::ABLE_TO_ACQUIRE),
        Op::Unpublish => state.intersects(S::NOT_ABLE_TO_ACQUIRE),
    }
}

/// Whether `notification` is deliverable in `state`
pub fn is_valid_notification(state: OwnershipState, notification: OwnershipNotification) -> bool {
    use OwnershipNotification as N;
    use OwnershipState as S;
    match notification {
        N::None
        | N::ForcedOwnershipAcquisitionNotification
        | N::ForcedOwnershipDivestitureNotification => true,
        N::ConfirmOwnershipAcquisitionCancellation => {
            state.intersects(S::TRYING_TO_CANCEL_ACQUISITION)
        }
        N::OwnershipAcquisitionNotification => {
            state.intersects(S::ACQUISITION_PENDING) || state.intersects(S::WILLING_TO_ACQUIRE)
        }
        N::OwnershipDivestitureNotification => state.intersects(S::DIVESTING),
        N::OwnershipUnavailable => state.intersects(S::WILLING_TO_ACQUIRE),
        N::RequestOwnershipAssumption => {
            state.intersects(S::NOT_ACQUIRING) && state.intersects(S::NOT_TRYING_TO_ACQUIRE)
        }
        N::RequestOwnershipRelease => {
            state.intersects(S::NOT_DIVESTING) && state.intersects(S::NOT_ASKED_TO_RELEASE)
        }
    }
}

fn reject(state: OwnershipState, operation: OwnershipOperation) -> bool {
    error!(%state, %operation, "ownership: invalid state for operation");
    false
}

/// Apply an externally initiated operation.
///
/// A pending forced acquisition annihilates against an incoming divestiture
/// (and a pending forced divestiture against an incoming acquisition),
/// resolving both into the corresponding resting state. Returns false and
/// leaves the state untouched for invalid transitions.
pub fn apply_operation(ownership: &mut StateOperation, operation: OwnershipOperation) -> bool {
    use OwnershipOperation as Op;
    use OwnershipState as S;

    if ownership.operation == Op::ForcedOwnershipAcquisition
        && matches!(
            operation,
            Op::NegotiatedOwnershipDivestiture
                | Op::UnconditionalOwnershipDivestiture
                | Op::ForcedOwnershipDivestiture
        )
    {
        ownership.state = S::unowned_able_to_acquire();
        ownership.operation = Op::None;
        return true;
    }

    if ownership.operation == Op::ForcedOwnershipDivestiture
        && matches!(
            operation,
            Op::OwnershipAcquisition
                | Op::OwnershipAcquisitionIfAvailable
                | Op::ForcedOwnershipAcquisition
        )
    {
        ownership.state = S::owned();
        ownership.operation = Op::None;
        return true;
    }

    match operation {
        Op::Publish => {
            if ownership.state.intersects(S::NOT_ABLE_TO_ACQUIRE) {
                ownership.state.remove(S::NOT_ABLE_TO_ACQUIRE);
            } else {
                return reject(ownership.state, operation);
            }
            ownership.state
                .insert(S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::NOT_TRYING_TO_ACQUIRE);
            ownership.operation = Op::Publish;
            true
        }

        Op::Unpublish => {
            if ownership.state.intersects(S::NOT_ABLE_TO_ACQUIRE) {
                return reject(ownership.state, operation);
            }
            ownership.state = S::unowned_not_able_to_acquire();
            ownership.operation = Op::Unpublish;
            true
        }

        Op::CancelNegotiatedOwnershipDivestiture => {
            if ownership.state.intersects(S::DIVESTING) {
                ownership.state.remove(S::DIVESTING);
            } else {
                return reject(ownership.state, operation);
            }
            if ownership.operation == Op::NegotiatedOwnershipDivestiture {
                ownership.operation = Op::None;
            } else {
                ownership.operation = Op::CancelNegotiatedOwnershipDivestiture;
            }
            ownership.state.insert(S::NOT_DIVESTING);
            true
        }

        Op::CancelOwnershipAcquisition => {
            if ownership.state.intersects(S::ACQUIRING) {
                ownership.state.remove(S::ACQUIRING);
            } else {
                return reject(ownership.state, operation);
            }
            ownership.operation = Op::CancelOwnershipAcquisition;
            ownership.state.insert(S::TRYING_TO_CANCEL_ACQUISITION);
            true
        }

        Op::NegotiatedOwnershipDivestiture => {
            if ownership.state.intersects(S::NOT_DIVESTING) {
                ownership.state.remove(S::NOT_DIVESTING);
            } else {
                return reject(ownership.state, operation);
            }
            if ownership.operation == Op::CancelNegotiatedOwnershipDivestiture {
                ownership.operation = Op::None;
            } else {
                ownership.operation = Op::NegotiatedOwnershipDivestiture;
            }
            ownership.state.insert(S::DIVESTING);
            true
        }

        Op::OwnershipAcquisition => {
            if ownership.state.intersects(S::NOT_ACQUIRING) {
                ownership.state.remove(S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE);
            } else {
                return reject(ownership.state, operation);
            }
            ownership.operation = Op::OwnershipAcquisition;
            ownership.state
                .insert(S::ACQUIRING | S::ACQUISITION_PENDING | S::NOT_TRYING_TO_ACQUIRE);
            true
        }

        Op::OwnershipAcquisitionIfAvailable => {
            if ownership.state.intersects(S::NOT_TRYING_TO_ACQUIRE)
                && !ownership.state.intersects(S::ACQUISITION_PENDING)
            {
                ownership.state.remove(S::NOT_TRYING_TO_ACQUIRE);
            } else {
                return reject(ownership.state, operation);
            }
            ownership.state.insert(S::WILLING_TO_ACQUIRE);
            ownership.operation = Op::OwnershipAcquisitionIfAvailable;
            true
        }

        Op::OwnershipReleaseFailure => {
            if ownership.state.intersects(S::ASKED_TO_RELEASE) {
                ownership.state.remove(S::ASKED_TO_RELEASE);
            } else {
                return reject(ownership.state, operation);
            }
            ownership.state.insert(S::NOT_ASKED_TO_RELEASE);
            ownership.operation = Op::OwnershipReleaseFailure;
            true
        }

        Op::OwnershipReleaseSuccess => {
            if ownership.state.intersects(S::ASKED_TO_RELEASE) {
                ownership.state
                    .remove(S::ASKED_TO_RELEASE | S::DIVESTING | S::NOT_DIVESTING | S::OWNED);
            } else {
                return reject(ownership.state, operation);
            }
            ownership.state.insert(
                S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::NOT_TRYING_TO_ACQUIRE | S::UNOWNED,
            );
            ownership.operation = Op::OwnershipReleaseSuccess;
            true
        }

        Op::UnconditionalOwnershipDivestiture => {
            if ownership.state.intersects(S::OWNED) {
                ownership.state.remove(
                    S::ASKED_TO_RELEASE
                        | S::DIVESTING
                        | S::NOT_ASKED_TO_RELEASE
                        | S::NOT_DIVESTING
                        | S::OWNED,
                );
            } else {
                return reject(ownership.state, operation);
            }
            ownership.state.insert(
                S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::NOT_TRYING_TO_ACQUIRE | S::UNOWNED,
            );
            ownership.operation = Op::UnconditionalOwnershipDivestiture;
            true
        }

        Op::ForcedOwnershipAcquisition => {
            if !ownership.state.intersects(S::UNOWNED) {
                return reject(ownership.state, operation);
            }
            ownership.state = S::owned();
            ownership.operation = Op::ForcedOwnershipAcquisition;
            true
        }

        Op::ForcedOwnershipDivestiture => {
            if !ownership.state.intersects(S::OWNED) {
                return reject(ownership.state, operation);
            }
            ownership.state = S::unowned_able_to_acquire();
            ownership.operation = Op::ForcedOwnershipDivestiture;
            true
        }

        Op::None => reject(ownership.state, operation),
    }
}

fn reject_notification(state: OwnershipState, notification: OwnershipNotification) -> bool {
    error!(%state, %notification, "ownership: invalid state for notification");
    false
}

/// Apply an arbitration notification to a state.
///
/// Returns false and leaves the state untouched for invalid transitions.
pub fn apply_notification(state: &mut OwnershipState, notification: OwnershipNotification) -> bool {
    use OwnershipNotification as N;
    use OwnershipState as S;

    match notification {
        N::ConfirmOwnershipAcquisitionCancellation => {
            if state.intersects(S::TRYING_TO_CANCEL_ACQUISITION) {
                state.remove(S::ACQUISITION_PENDING | S::TRYING_TO_CANCEL_ACQUISITION);
            } else {
                return reject_notification(*state, notification);
            }
            state.insert(S::NOT_ACQUIRING);
            true
        }

        N::OwnershipAcquisitionNotification => {
            if state.intersects(S::ACQUISITION_PENDING) || state.intersects(S::WILLING_TO_ACQUIRE) {
                state.remove(
                    S::ABLE_TO_ACQUIRE
                        | S::ACQUIRING
                        | S::ACQUISITION_PENDING
                        | S::NOT_ACQUIRING
                        | S::NOT_TRYING_TO_ACQUIRE
                        | S::TRYING_TO_CANCEL_ACQUISITION
                        | S::UNOWNED
                        | S::WILLING_TO_ACQUIRE,
                );
            } else {
                return reject_notification(*state, notification);
            }
            state.insert(S::NOT_ASKED_TO_RELEASE | S::NOT_DIVESTING | S::OWNED);
            true
        }

        N::OwnershipDivestitureNotification => {
            if state.intersects(S::DIVESTING) {
                state.remove(
                    S::DIVESTING | S::ASKED_TO_RELEASE | S::NOT_ASKED_TO_RELEASE | S::OWNED,
                );
            } else {
                return reject_notification(*state, notification);
            }
            state.insert(
                S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::NOT_TRYING_TO_ACQUIRE | S::UNOWNED,
            );
            true
        }

        N::OwnershipUnavailable => {
            if state.intersects(S::WILLING_TO_ACQUIRE) {
                state.remove(S::WILLING_TO_ACQUIRE);
            } else {
                return reject_notification(*state, notification);
            }
            state.insert(S::NOT_TRYING_TO_ACQUIRE);
            true
        }

        N::RequestOwnershipAssumption => {
            // no state change
            true
        }

        N::RequestOwnershipRelease => {
            if state.intersects(S::NOT_ASKED_TO_RELEASE) {
                state.remove(S::NOT_ASKED_TO_RELEASE);
            } else {
                return reject_notification(*state, notification);
            }
            state.insert(S::ASKED_TO_RELEASE);
            true
        }

        N::ForcedOwnershipAcquisitionNotification => {
            *state = S::owned();
            true
        }

        N::ForcedOwnershipDivestitureNotification => {
            *state = S::unowned_able_to_acquire();
            true
        }

        N::None => reject_notification(*state, notification),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OwnershipOperation as Op;
    use OwnershipState as S;

    fn pair(state: OwnershipState, operation: OwnershipOperation) -> StateOperation {
        StateOperation { state, operation }
    }

    #[test]
    fn test_validate_resting_states() {
        assert!(S::owned().validate());
        assert!(S::unowned_able_to_acquire().validate());
        assert!(S::unowned_not_able_to_acquire().validate());
        assert!(!(S::OWNED | S::UNOWNED).validate());
        assert!(!S::empty().validate());
        assert!(!(S::OWNED | S::DIVESTING | S::NOT_DIVESTING).validate());
    }

    #[test]
    fn test_display() {
        assert_eq!(S::owned().to_string(), "Owned|NotDivesting|NotAskedToRelease");
        assert_eq!(S::empty().to_string(), "-");
    }

    #[test]
    fn test_publish() {
        let mut ownership = pair(S::unowned_not_able_to_acquire(), Op::Publish);
        assert!(apply_operation(&mut ownership, Op::Publish));
        assert!(ownership.state.validate());
        assert_eq!(ownership.state, S::unowned_able_to_acquire());
        assert_eq!(ownership.operation, Op::Publish);
    }

    #[test]
    fn test_unpublish() {
        let mut ownership = pair(S::unowned_able_to_acquire(), Op::None);
        assert!(apply_operation(&mut ownership, Op::Unpublish));
        assert_eq!(ownership.state, S::unowned_not_able_to_acquire());
        assert_eq!(ownership.operation, Op::Unpublish);
    }

    #[test]
    fn test_cancel_negotiated_ownership_divestiture() {
        let mut ownership = pair(
            S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE,
            Op::None,
        );
        assert!(apply_operation(&mut ownership, Op::CancelNegotiatedOwnershipDivestiture));
        assert!(ownership.state.validate());
        assert_eq!(ownership.state, S::owned());
        assert_eq!(ownership.operation, Op::CancelNegotiatedOwnershipDivestiture);
    }

    #[test]
    fn test_cancel_negotiated_ownership_divestiture_undo() {
        let mut ownership = pair(
            S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE,
            Op::NegotiatedOwnershipDivestiture,
        );
        assert!(apply_operation(&mut ownership, Op::CancelNegotiatedOwnershipDivestiture));
        assert_eq!(ownership.state, S::owned());
        assert_eq!(ownership.operation, Op::None);
    }

    #[test]
    fn test_cancel_ownership_acquisition() {
        let mut ownership = pair(
            S::UNOWNED
                | S::ABLE_TO_ACQUIRE
                | S::ACQUISITION_PENDING
                | S::ACQUIRING
                | S::NOT_TRYING_TO_ACQUIRE,
            Op::None,
        );
        assert!(apply_operation(&mut ownership, Op::CancelOwnershipAcquisition));
        assert!(ownership.state.validate());
        assert_eq!(
            ownership.state,
            S::UNOWNED
                | S::ABLE_TO_ACQUIRE
                | S::ACQUISITION_PENDING
                | S::TRYING_TO_CANCEL_ACQUISITION
                | S::NOT_TRYING_TO_ACQUIRE
        );
        assert_eq!(ownership.operation, Op::CancelOwnershipAcquisition);
    }

    #[test]
    fn test_negotiated_ownership_divestiture() {
        let mut ownership = pair(S::owned(), Op::None);
        assert!(apply_operation(&mut ownership, Op::NegotiatedOwnershipDivestiture));
        assert!(ownership.state.validate());
        assert_eq!(
            ownership.state,
            S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE
        );
        assert_eq!(ownership.operation, Op::NegotiatedOwnershipDivestiture);
    }

    #[test]
    fn test_negotiated_ownership_divestiture_undo() {
        let mut ownership = pair(S::owned(), Op::CancelNegotiatedOwnershipDivestiture);
        assert!(apply_operation(&mut ownership, Op::NegotiatedOwnershipDivestiture));
        assert_eq!(
            ownership.state,
            S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE
        );
        assert_eq!(ownership.operation, Op::None);
    }

    #[test]
    fn test_ownership_acquisition() {
        let mut ownership = pair(
            S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE,
            Op::None,
        );
        assert!(apply_operation(&mut ownership, Op::OwnershipAcquisition));
        assert!(ownership.state.validate());
        assert_eq!(
            ownership.state,
            S::UNOWNED
                | S::ABLE_TO_ACQUIRE
                | S::ACQUISITION_PENDING
                | S::ACQUIRING
                | S::NOT_TRYING_TO_ACQUIRE
        );
        assert_eq!(ownership.operation, Op::OwnershipAcquisition);
    }

    #[test]
    fn test_ownership_acquisition_if_available() {
        let mut ownership = pair(S::unowned_able_to_acquire(), Op::None);
        assert!(apply_operation(&mut ownership, Op::OwnershipAcquisitionIfAvailable));
        assert!(ownership.state.validate());
        assert_eq!(
            ownership.state,
            S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE
        );
        assert_eq!(ownership.operation, Op::OwnershipAcquisitionIfAvailable);
    }

    #[test]
    fn test_ownership_release_failure() {
        let mut ownership = pair(
            S::OWNED | S::NOT_DIVESTING | S::ASKED_TO_RELEASE,
            Op::None,
        );
        assert!(apply_operation(&mut ownership, Op::OwnershipReleaseFailure));
        assert!(ownership.state.validate());
        assert_eq!(ownership.state, S::owned());
        assert_eq!(ownership.operation, Op::OwnershipReleaseFailure);
    }

    #[test]
    fn test_ownership_release_success() {
        let mut ownership = pair(
            S::OWNED | S::NOT_DIVESTING | S::ASKED_TO_RELEASE,
            Op::None,
        );
        assert!(apply_operation(&mut ownership, Op::OwnershipReleaseSuccess));
        assert!(ownership.state.validate());
        assert_eq!(ownership.state, S::unowned_able_to_acquire());
        assert_eq!(ownership.operation, Op::OwnershipReleaseSuccess);
    }

    #[test]
    fn test_unconditional_ownership_divestiture() {
        let mut ownership = pair(S::owned(), Op::None);
        assert!(apply_operation(&mut ownership, Op::UnconditionalOwnershipDivestiture));
        assert!(ownership.state.validate());
        assert_eq!(ownership.state, S::unowned_able_to_acquire());
        assert_eq!(ownership.operation, Op::UnconditionalOwnershipDivestiture);
    }

    #[test]
    fn test_forced_acquisition_cancels_against_divestiture() {
        let mut ownership = pair(S::owned(), Op::ForcedOwnershipAcquisition);
        assert!(apply_operation(&mut ownership, Op::ForcedOwnershipDivestiture));
        assert_eq!(ownership.state, S::unowned_able_to_acquire());
        assert_eq!(ownership.operation, Op::None);
    }

    #[test]
    fn test_forced_divestiture_cancels_against_acquisition() {
        let mut ownership = pair(S::unowned_able_to_acquire(), Op::ForcedOwnershipDivestiture);
        assert!(apply_operation(&mut ownership, Op::OwnershipAcquisition));
        assert_eq!(ownership.state, S::owned());
        assert_eq!(ownership.operation, Op::None);
    }

    #[test]
    fn test_invalid_operation_leaves_state() {
        let mut ownership = pair(S::owned(), Op::None);
        let before = ownership;
        assert!(!apply_operation(&mut ownership, Op::Publish));
        assert_eq!(ownership, before);
    }

    #[test]
    fn test_confirm_ownership_acquisition_cancellation() {
        let mut state = S::UNOWNED
            | S::ABLE_TO_ACQUIRE
            | S::ACQUISITION_PENDING
            | S::TRYING_TO_CANCEL_ACQUISITION
            | S::NOT_TRYING_TO_ACQUIRE;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::ConfirmOwnershipAcquisitionCancellation
        ));
        assert!(state.validate());
        assert_eq!(state, S::unowned_able_to_acquire());
    }

    #[test]
    fn test_ownership_acquisition_notification_pending() {
        let mut state = S::UNOWNED
            | S::ABLE_TO_ACQUIRE
            | S::ACQUISITION_PENDING
            | S::ACQUIRING
            | S::NOT_TRYING_TO_ACQUIRE;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::OwnershipAcquisitionNotification
        ));
        assert!(state.validate());
        assert_eq!(state, S::owned());
    }

    #[test]
    fn test_ownership_acquisition_notification_cancelling() {
        let mut state = S::UNOWNED
            | S::ABLE_TO_ACQUIRE
            | S::ACQUISITION_PENDING
            | S::TRYING_TO_CANCEL_ACQUISITION
            | S::NOT_TRYING_TO_ACQUIRE;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::OwnershipAcquisitionNotification
        ));
        assert!(state.validate());
        assert_eq!(state, S::owned());
    }

    #[test]
    fn test_ownership_acquisition_notification_willing() {
        let mut state =
            S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::OwnershipAcquisitionNotification
        ));
        assert!(state.validate());
        assert_eq!(state, S::owned());
    }

    #[test]
    fn test_ownership_divestiture_notification() {
        let mut state = S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::OwnershipDivestitureNotification
        ));
        assert!(state.validate());
        assert_eq!(state, S::unowned_able_to_acquire());
    }

    #[test]
    fn test_ownership_unavailable() {
        let mut state =
            S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::OwnershipUnavailable
        ));
        assert!(state.validate());
        assert_eq!(state, S::unowned_able_to_acquire());
    }

    #[test]
    fn test_request_ownership_release() {
        let mut state = S::owned();
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::RequestOwnershipRelease
        ));
        assert!(state.validate());
        assert_eq!(state, S::OWNED | S::NOT_DIVESTING | S::ASKED_TO_RELEASE);
    }

    #[test]
    fn test_request_ownership_assumption_no_change() {
        let mut state = S::unowned_able_to_acquire();
        let before = state;
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::RequestOwnershipAssumption
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn test_forced_notifications() {
        let mut state = S::unowned_able_to_acquire();
        assert!(apply_notification(
            &mut state,
            OwnershipNotification::ForcedOwnershipAcquisitionNotification
        ));
        assert_eq!(state, S::owned());

        assert!(apply_notification(
            &mut state,
            OwnershipNotification::ForcedOwnershipDivestitureNotification
        ));
        assert_eq!(state, S::unowned_able_to_acquire());
    }

    #[test]
    fn test_invalid_notification_leaves_state() {
        let mut state = S::owned();
        let before = state;
        assert!(!apply_notification(
            &mut state,
            OwnershipNotification::OwnershipUnavailable
        ));
        assert_eq!(state, before);
    }
}
