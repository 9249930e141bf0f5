//! Per-property ownership map and arbitration

use crate::state::{
    is_valid_notification, OwnershipNotification, OwnershipOperation, OwnershipState,
};
use std::fmt;
use tracing::warn;

/// Opaque key identifying one federate within an ownership map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FederateKey(pub u64);

impl fmt::Display for FederateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "federate#{}", self.0)
    }
}

/// One federate's participation in a property's ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipEntry {
    /// The participating federate
    pub federate: FederateKey,
    /// Its state as seen by the master
    pub state: OwnershipState,
    /// The pending notification for it, if any
    pub notification: OwnershipNotification,
}

impl OwnershipEntry {
    /// Build an entry with no pending notification
    pub fn new(federate: FederateKey, state: OwnershipState) -> Self {
        Self {
            federate,
            state,
            notification: OwnershipNotification::None,
        }
    }

    /// Whether this entry holds (or is about to hold) ownership
    pub fn has_ownership(&self) -> bool {
        use OwnershipNotification as N;
        match self.notification {
            N::None => self.state.intersects(OwnershipState::OWNED),
            N::ForcedOwnershipAcquisitionNotification
            | N::OwnershipAcquisitionNotification
            | N::RequestOwnershipRelease => true,
            N::ConfirmOwnershipAcquisitionCancellation
            | N::ForcedOwnershipDivestitureNotification
            | N::OwnershipDivestitureNotification
            | N::OwnershipUnavailable
            | N::RequestOwnershipAssumption => false,
        }
    }
}

/// The ordered list of participants in one property's ownership.
///
/// Insertion order is significant: the first eligible acquirer wins ties.
pub type OwnershipMap = Vec<OwnershipEntry>;

/// Index of the entry that currently holds ownership
pub fn find_owner(map: &OwnershipMap) -> Option<usize> {
    map.iter().position(OwnershipEntry::has_ownership)
}

/// Index of the first entry with `flag` set whose federate the ownership
/// policy accepts as a replacement owner
pub fn find_potential_owner(
    map: &OwnershipMap,
    flag: OwnershipState,
    eligible: &dyn Fn(FederateKey) -> bool,
) -> Option<usize> {
    map.iter()
        .position(|entry| entry.state.intersects(flag) && eligible(entry.federate))
}

/// Whether any entry is a publisher (not `NOT_ABLE_TO_ACQUIRE`)
pub fn has_publisher(map: &OwnershipMap) -> bool {
    map.iter()
        .any(|entry| !entry.state.intersects(OwnershipState::NOT_ABLE_TO_ACQUIRE))
}

/// Check map consistency; returns a description of the first violation.
pub fn validate_ownership(map: &OwnershipMap) -> Option<String> {
    if map.is_empty() {
        return None;
    }
    let mut owners = 0;
    for entry in map {
        if !entry.state.validate() {
            return Some(format!("invalid state {}", entry.state));
        }
        if !is_valid_notification(entry.state, entry.notification) {
            return Some(format!(
                "invalid state {} for notification {}",
                entry.state, entry.notification
            ));
        }
        if entry.has_ownership() {
            owners += 1;
        }
    }
    if owners > 1 {
        return Some(format!("invalid state: {} owners", owners));
    }
    None
}

fn notify_target_or_broadcast(
    map: &mut OwnershipMap,
    self_index: usize,
    eligible: &dyn Fn(FederateKey) -> bool,
) {
    let target = find_potential_owner(map, OwnershipState::WILLING_TO_ACQUIRE, eligible)
        .or_else(|| find_potential_owner(map, OwnershipState::ACQUISITION_PENDING, eligible));
    if let Some(target) = target {
        map[target].notification = OwnershipNotification::OwnershipAcquisitionNotification;
    } else {
        for (index, entry) in map.iter_mut().enumerate() {
            if index != self_index && entry.state.intersects(OwnershipState::ABLE_TO_ACQUIRE) {
                entry.notification = OwnershipNotification::RequestOwnershipAssumption;
            }
        }
    }
}

/// Annotate the map with the notifications produced by `operation`, issued by
/// the entry at `self_index` whose state has already been stepped.
///
/// `eligible` is the ownership-policy filter: a federate it rejects is
/// skipped when selecting a replacement owner.
pub fn update_ownership_notifications(
    map: &mut OwnershipMap,
    self_index: usize,
    operation: OwnershipOperation,
    eligible: &dyn Fn(FederateKey) -> bool,
) {
    use OwnershipNotification as N;
    use OwnershipOperation as Op;
    use OwnershipState as S;

    if map[self_index].notification != N::None {
        warn!(
            notification = %map[self_index].notification,
            "arbitration entered with a pending notification"
        );
    }

    match operation {
        Op::OwnershipAcquisition => match find_owner(map) {
            None => {
                map[self_index].notification = N::OwnershipAcquisitionNotification;
            }
            Some(owner) if map[owner].state.intersects(S::DIVESTING) => {
                map[self_index].notification = N::OwnershipAcquisitionNotification;
                map[owner].notification = N::OwnershipDivestitureNotification;
            }
            Some(owner) if map[owner].state.intersects(S::NOT_ASKED_TO_RELEASE) => {
                map[owner].notification = N::RequestOwnershipRelease;
            }
            Some(_) => {}
        },

        Op::OwnershipAcquisitionIfAvailable => match find_owner(map) {
            None => {
                map[self_index].notification = N::OwnershipAcquisitionNotification;
            }
            Some(owner) if map[owner].state.intersects(S::DIVESTING) => {
                map[self_index].notification = N::OwnershipAcquisitionNotification;
                map[owner].notification = N::OwnershipDivestitureNotification;
            }
            Some(_) => {
                map[self_index].notification = N::OwnershipUnavailable;
            }
        },

        Op::NegotiatedOwnershipDivestiture => {
            let target = find_potential_owner(map, S::WILLING_TO_ACQUIRE, eligible)
                .or_else(|| find_potential_owner(map, S::ACQUISITION_PENDING, eligible));
            if let Some(target) = target {
                map[self_index].notification = N::OwnershipDivestitureNotification;
                map[target].notification = N::OwnershipAcquisitionNotification;
            } else {
                for (index, entry) in map.iter_mut().enumerate() {
                    if index != self_index && entry.state.intersects(S::ABLE_TO_ACQUIRE) {
                        entry.notification = N::RequestOwnershipAssumption;
                    }
                }
            }
        }

        Op::OwnershipReleaseSuccess => {
            map[self_index].notification = N::None;
            notify_target_or_broadcast(map, self_index, eligible);
        }

        Op::UnconditionalOwnershipDivestiture => {
            notify_target_or_broadcast(map, self_index, eligible);
        }

        Op::Unpublish => {
            if map[self_index].state.intersects(S::OWNED) {
                notify_target_or_broadcast(map, self_index, eligible);
            }
        }

        Op::ForcedOwnershipAcquisition => {
            map[self_index].notification = N::ForcedOwnershipAcquisitionNotification;
            for (index, entry) in map.iter_mut().enumerate() {
                if index != self_index {
                    if entry.state.intersects(S::OWNED) {
                        entry.notification = N::ForcedOwnershipDivestitureNotification;
                    } else if matches!(
                        entry.notification,
                        N::ForcedOwnershipAcquisitionNotification
                            | N::OwnershipAcquisitionNotification
                    ) {
                        entry.notification = N::None;
                    }
                }
            }
        }

        Op::ForcedOwnershipDivestiture => {
            map[self_index].notification = N::ForcedOwnershipDivestitureNotification;
            notify_target_or_broadcast(map, self_index, eligible);
        }

        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OwnershipNotification as N;
    use OwnershipOperation as Op;
    use OwnershipState as S;

    fn entry(index: u64, state: OwnershipState) -> OwnershipEntry {
        OwnershipEntry::new(FederateKey(index), state)
    }

    fn allow_all(_: FederateKey) -> bool {
        true
    }

    #[test]
    fn test_negotiated_divestiture_no_taker_broadcasts() {
        let mut map = vec![
            entry(0, S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE),
            entry(1, S::unowned_able_to_acquire()),
        ];
        update_ownership_notifications(&mut map, 0, Op::NegotiatedOwnershipDivestiture, &allow_all);
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::RequestOwnershipAssumption);
    }

    #[test]
    fn test_negotiated_divestiture_with_willing_taker() {
        let mut map = vec![
            entry(0, S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE),
            entry(
                1,
                S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE,
            ),
        ];
        update_ownership_notifications(&mut map, 0, Op::NegotiatedOwnershipDivestiture, &allow_all);
        assert_eq!(map[0].notification, N::OwnershipDivestitureNotification);
        assert_eq!(map[1].notification, N::OwnershipAcquisitionNotification);
    }

    #[test]
    fn test_acquisition_with_stable_owner_requests_release() {
        let mut map = vec![
            entry(0, S::unowned_able_to_acquire()),
            entry(1, S::owned()),
        ];
        update_ownership_notifications(&mut map, 0, Op::OwnershipAcquisition, &allow_all);
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::RequestOwnershipRelease);
    }

    #[test]
    fn test_acquisition_with_divesting_owner_pairs_up() {
        let mut map = vec![
            entry(0, S::unowned_able_to_acquire()),
            entry(1, S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE),
        ];
        update_ownership_notifications(&mut map, 0, Op::OwnershipAcquisition, &allow_all);
        assert_eq!(map[0].notification, N::OwnershipAcquisitionNotification);
        assert_eq!(map[1].notification, N::OwnershipDivestitureNotification);
    }

    #[test]
    fn test_acquisition_if_available_with_stable_owner_unavailable() {
        let mut map = vec![
            entry(0, S::unowned_able_to_acquire()),
            entry(1, S::owned()),
        ];
        update_ownership_notifications(
            &mut map,
            0,
            Op::OwnershipAcquisitionIfAvailable,
            &allow_all,
        );
        assert_eq!(map[0].notification, N::OwnershipUnavailable);
        assert_eq!(map[1].notification, N::None);
    }

    #[test]
    fn test_acquisition_if_available_with_divesting_owner() {
        let mut map = vec![
            entry(0, S::unowned_able_to_acquire()),
            entry(1, S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE),
        ];
        update_ownership_notifications(
            &mut map,
            0,
            Op::OwnershipAcquisitionIfAvailable,
            &allow_all,
        );
        assert_eq!(map[0].notification, N::OwnershipAcquisitionNotification);
        assert_eq!(map[1].notification, N::OwnershipDivestitureNotification);
    }

    #[test]
    fn test_acquisition_if_available_unowned_grants() {
        let mut map = vec![
            entry(0, S::unowned_able_to_acquire()),
            entry(1, S::unowned_able_to_acquire()),
        ];
        update_ownership_notifications(
            &mut map,
            0,
            Op::OwnershipAcquisitionIfAvailable,
            &allow_all,
        );
        assert_eq!(map[0].notification, N::OwnershipAcquisitionNotification);
        assert_eq!(map[1].notification, N::None);
    }

    #[test]
    fn test_release_success_no_taker_broadcasts() {
        let mut map = vec![
            entry(0, S::OWNED | S::NOT_DIVESTING | S::ASKED_TO_RELEASE),
            entry(1, S::unowned_able_to_acquire()),
        ];
        update_ownership_notifications(&mut map, 0, Op::OwnershipReleaseSuccess, &allow_all);
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::RequestOwnershipAssumption);
    }

    #[test]
    fn test_release_success_with_willing_taker() {
        let mut map = vec![
            entry(0, S::OWNED | S::NOT_DIVESTING | S::ASKED_TO_RELEASE),
            entry(
                1,
                S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE,
            ),
        ];
        update_ownership_notifications(&mut map, 0, Op::OwnershipReleaseSuccess, &allow_all);
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::OwnershipAcquisitionNotification);
    }

    #[test]
    fn test_unconditional_divestiture_no_taker_broadcasts() {
        let mut map = vec![
            entry(0, S::owned()),
            entry(1, S::unowned_able_to_acquire()),
        ];
        update_ownership_notifications(
            &mut map,
            0,
            Op::UnconditionalOwnershipDivestiture,
            &allow_all,
        );
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::RequestOwnershipAssumption);
    }

    #[test]
    fn test_unconditional_divestiture_with_pending_acquirer() {
        let mut map = vec![
            entry(0, S::owned()),
            entry(
                1,
                S::UNOWNED
                    | S::ABLE_TO_ACQUIRE
                    | S::ACQUISITION_PENDING
                    | S::ACQUIRING
                    | S::NOT_TRYING_TO_ACQUIRE,
            ),
        ];
        update_ownership_notifications(
            &mut map,
            0,
            Op::UnconditionalOwnershipDivestiture,
            &allow_all,
        );
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::OwnershipAcquisitionNotification);
    }

    #[test]
    fn test_unconditional_divestiture_with_willing_acquirer() {
        let mut map = vec![
            entry(0, S::owned()),
            entry(
                1,
                S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE,
            ),
        ];
        update_ownership_notifications(
            &mut map,
            0,
            Op::UnconditionalOwnershipDivestiture,
            &allow_all,
        );
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::OwnershipAcquisitionNotification);
    }

    #[test]
    fn test_forced_acquisition_forces_out_owner_and_clears_intents() {
        let mut map = vec![
            entry(0, S::owned()),
            entry(1, S::owned()),
            entry(2, S::unowned_able_to_acquire()),
        ];
        map[2].notification = N::OwnershipAcquisitionNotification;
        update_ownership_notifications(&mut map, 0, Op::ForcedOwnershipAcquisition, &allow_all);
        assert_eq!(map[0].notification, N::ForcedOwnershipAcquisitionNotification);
        assert_eq!(map[1].notification, N::ForcedOwnershipDivestitureNotification);
        assert_eq!(map[2].notification, N::None);
    }

    #[test]
    fn test_policy_filter_skips_ineligible_taker() {
        let mut map = vec![
            entry(0, S::OWNED | S::DIVESTING | S::NOT_ASKED_TO_RELEASE),
            entry(
                1,
                S::UNOWNED | S::ABLE_TO_ACQUIRE | S::NOT_ACQUIRING | S::WILLING_TO_ACQUIRE,
            ),
        ];
        let reject_one = |key: FederateKey| key != FederateKey(1);
        update_ownership_notifications(
            &mut map,
            0,
            Op::NegotiatedOwnershipDivestiture,
            &reject_one,
        );
        // ineligible taker falls through to the broadcast path
        assert_eq!(map[0].notification, N::None);
        assert_eq!(map[1].notification, N::RequestOwnershipAssumption);
    }

    #[test]
    fn test_find_owner() {
        let map = vec![
            entry(0, S::unowned_able_to_acquire()),
            entry(1, S::owned()),
        ];
        assert_eq!(find_owner(&map), Some(1));
        assert_eq!(find_owner(&map[..1].to_vec()), None);
    }

    #[test]
    fn test_has_publisher() {
        let publishers = vec![entry(0, S::unowned_able_to_acquire())];
        assert!(has_publisher(&publishers));
        let subscribers = vec![entry(0, S::unowned_not_able_to_acquire())];
        assert!(!has_publisher(&subscribers));
        assert!(!has_publisher(&vec![]));
    }

    #[test]
    fn test_validate_ownership() {
        assert_eq!(validate_ownership(&vec![]), None);
        let good = vec![entry(0, S::owned()), entry(1, S::unowned_able_to_acquire())];
        assert_eq!(validate_ownership(&good), None);
        let two_owners = vec![entry(0, S::owned()), entry(1, S::owned())];
        assert!(validate_ownership(&two_owners).unwrap().contains("2 owners"));
        let broken = vec![entry(0, S::OWNED | S::UNOWNED)];
        assert!(validate_ownership(&broken).unwrap().contains("invalid state"));
    }
}
