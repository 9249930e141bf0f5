//! # muster-ownership
//!
//! The ownership state machine arbitrating which federate may write each
//! replicated property. Every property carries an [`OwnershipState`] bitset;
//! externally initiated [`OwnershipOperation`]s and arbitration-produced
//! [`OwnershipNotification`]s step the state through a fixed transition
//! table. The per-property [`OwnershipMap`] tracks every participating
//! federate and resolves competing intents.
//!
//! All stepping is synchronous; invalid transitions are logged and rejected,
//! never fatal.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod map;
mod state;

pub use error::{OwnershipError, OwnershipResult};
pub use map::{
    find_owner, find_potential_owner, has_publisher, update_ownership_notifications,
    validate_ownership, FederateKey, OwnershipEntry, OwnershipMap,
};
pub use state::{
    apply_notification, apply_operation, is_valid_notification, is_valid_state_after_operation,
    is_valid_state_before_operation, OwnershipNotification, OwnershipOperation, OwnershipState,
    StateNotification, StateOperation,
};
