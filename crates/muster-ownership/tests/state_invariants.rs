//! Property tests over the ownership state machine.
//!
//! For every reachable valid state and every operation, a successful step
//! must land in a valid state satisfying the after-operation predicate, and a
//! rejected step must leave the state untouched.

use muster_ownership::{
    apply_notification, apply_operation, is_valid_state_after_operation,
    is_valid_state_before_operation, OwnershipNotification, OwnershipOperation, OwnershipState,
    StateOperation,
};
use proptest::prelude::*;

fn valid_states() -> impl Strategy<Value = OwnershipState> {
    use OwnershipState as S;
    prop_oneof![
        // owned branch: divesting and asked-to-release alternatives
        (any::<bool>(), any::<bool>()).prop_map(|(divesting, asked)| {
            let mut s = S::OWNED;
            s |= if divesting { S::DIVESTING } else { S::NOT_DIVESTING };
            s |= if asked { S::ASKED_TO_RELEASE } else { S::NOT_ASKED_TO_RELEASE };
            s
        }),
        // pure subscriber
        Just(S::unowned_not_able_to_acquire()),
        // publisher branch: acquisition-pending and willing alternatives,
        // excluding the pending+willing combination the or-rule forbids
        (0usize..3, any::<bool>(), any::<bool>()).prop_map(|(acq, willing, cancelling)| {
            let mut s = S::UNOWNED | S::ABLE_TO_ACQUIRE;
            match acq {
                0 => s |= S::NOT_ACQUIRING,
                1 => s |= S::ACQUISITION_PENDING | S::ACQUIRING,
                _ => {
                    s |= S::ACQUISITION_PENDING;
                    if cancelling {
                        s |= S::TRYING_TO_CANCEL_ACQUISITION;
                    } else {
                        s |= S::ACQUIRING;
                    }
                }
            }
            if willing && acq == 0 {
                s |= S::WILLING_TO_ACQUIRE;
            } else {
                s |= S::NOT_TRYING_TO_ACQUIRE;
            }
            s
        }),
    ]
}

fn operations() -> impl Strategy<Value = OwnershipOperation> {
    use OwnershipOperation as Op;
    prop_oneof![
        Just(Op::CancelNegotiatedOwnershipDivestiture),
        Just(Op::CancelOwnershipAcquisition),
        Just(Op::ForcedOwnershipAcquisition),
        Just(Op::ForcedOwnershipDivestiture),
        Just(Op::NegotiatedOwnershipDivestiture),
        Just(Op::OwnershipAcquisition),
        Just(Op::OwnershipAcquisitionIfAvailable),
        Just(Op::OwnershipReleaseFailure),
        Just(Op::OwnershipReleaseSuccess),
        Just(Op::Publish),
        Just(Op::UnconditionalOwnershipDivestiture),
        Just(Op::Unpublish),
    ]
}

fn notifications() -> impl Strategy<Value = OwnershipNotification> {
    use OwnershipNotification as N;
    prop_oneof![
        Just(N::ConfirmOwnershipAcquisitionCancellation),
        Just(N::ForcedOwnershipAcquisitionNotification),
        Just(N::ForcedOwnershipDivestitureNotification),
        Just(N::OwnershipAcquisitionNotification),
        Just(N::OwnershipDivestitureNotification),
        Just(N::OwnershipUnavailable),
        Just(N::RequestOwnershipAssumption),
        Just(N::RequestOwnershipRelease),
    ]
}

proptest! {
    #[test]
    fn generator_yields_valid_states(state in valid_states()) {
        prop_assert!(state.validate(), "generator produced invalid state {}", state);
    }

    #[test]
    fn operations_preserve_validity(state in valid_states(), operation in operations()) {
        let mut ownership = StateOperation { state, operation: OwnershipOperation::None };
        let before = ownership;
        let applied = apply_operation(&mut ownership, operation);
        if applied {
            prop_assert!(
                is_valid_state_before_operation(before.state, operation),
                "accepted {} from state {} the before-predicate rejects", operation, before.state
            );
            prop_assert!(
                ownership.state.validate(),
                "{} on {} produced invalid {}", operation, before.state, ownership.state
            );
            prop_assert!(
                is_valid_state_after_operation(ownership.state, operation),
                "{} on {} violated the after-predicate with {}",
                operation, before.state, ownership.state
            );
        } else {
            prop_assert_eq!(ownership, before, "rejected operation mutated the state");
        }
    }

    #[test]
    fn notifications_preserve_validity(state in valid_states(), notification in notifications()) {
        let mut current = state;
        let applied = apply_notification(&mut current, notification);
        if applied {
            prop_assert!(
                current.validate(),
                "{} on {} produced invalid {}", notification, state, current
            );
        } else {
            prop_assert_eq!(current, state, "rejected notification mutated the state");
        }
    }

    #[test]
    fn double_application_never_corrupts(state in valid_states(), operation in operations()) {
        let mut ownership = StateOperation { state, operation: OwnershipOperation::None };
        if apply_operation(&mut ownership, operation) {
            // pending operation cleared, as the sync pass does after arbitration
            ownership.operation = OwnershipOperation::None;
            let once = ownership;
            apply_operation(&mut ownership, operation);
            prop_assert!(
                ownership.state.validate(),
                "repeating {} corrupted {} into {}", operation, once.state, ownership.state
            );
        }
    }
}
