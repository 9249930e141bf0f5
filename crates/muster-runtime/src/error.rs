//! Runtime error types

use muster_ownership::{OwnershipOperation, OwnershipState};
use thiserror::Error;

/// Errors from the federation core
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Attempted to write a property this federate does not own
    #[error("not owned: {class}.{property}")]
    NotOwned {
        /// Object class name
        class: String,
        /// Property name
        property: String,
    },

    /// The ownership state machine rejected the operation
    #[error("invalid ownership state {state} for {operation}")]
    InvalidOwnershipState {
        /// State at the time of the attempt
        state: OwnershipState,
        /// Rejected operation
        operation: OwnershipOperation,
    },

    /// The federate has not joined a federation
    #[error("no federation")]
    NoFederation,

    /// The component is shutting down
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// An object with this id already exists on the federate
    #[error("object already exists: {0}")]
    ObjectExists(muster_primitives::ObjectId),

    /// Process registration failed
    #[error("process registration failed: {0}")]
    ProcessRegistration(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_owned_display() {
        let err = RuntimeError::NotOwned {
            class: "Unit".into(),
            property: "name".into(),
        };
        assert_eq!(format!("{}", err), "not owned: Unit.name");
    }

    #[test]
    fn test_invalid_ownership_state_display() {
        let err = RuntimeError::InvalidOwnershipState {
            state: OwnershipState::owned(),
            operation: OwnershipOperation::Publish,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Owned"));
        assert!(msg.contains("Publish"));
    }
}
