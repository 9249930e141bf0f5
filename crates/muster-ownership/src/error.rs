//! Ownership error types

use crate::state::{OwnershipNotification, OwnershipOperation, OwnershipState};
use thiserror::Error;

/// Errors from stepping the ownership state machine
#[derive(Debug, Error)]
pub enum OwnershipError {
    /// The operation is not legal in the current state
    #[error("invalid state {state} for operation {operation}")]
    InvalidOperation {
        /// State at the time of the attempt
        state: OwnershipState,
        /// Rejected operation
        operation: OwnershipOperation,
    },

    /// The notification is not legal in the current state
    #[error("invalid state {state} for notification {notification}")]
    InvalidNotification {
        /// State at the time of the attempt
        state: OwnershipState,
        /// Rejected notification
        notification: OwnershipNotification,
    },
}

/// Result type for ownership operations
pub type OwnershipResult<T> = Result<T, OwnershipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OwnershipError::InvalidOperation {
            state: OwnershipState::OWNED | OwnershipState::NOT_DIVESTING,
            operation: OwnershipOperation::Publish,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Owned"));
        assert!(msg.contains("Publish"));
    }
}
