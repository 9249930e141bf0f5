//! Primitive error types

use thiserror::Error;

/// Errors from parsing primitive types
#[derive(Debug, Error)]
pub enum PrimitiveError {
    /// Invalid hex string
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    /// Invalid length
    #[error("invalid id length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        got: usize,
    },

    /// Unknown discriminant
    #[error("unknown discriminant: {0}")]
    UnknownDiscriminant(i32),
}

/// Result type for primitive operations
pub type PrimitiveResult<T> = Result<T, PrimitiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_invalid_hex() {
        let err = PrimitiveError::InvalidHex("zz".into());
        let msg = format!("{}", err);
        assert!(msg.contains("invalid hex"));
        assert!(msg.contains("zz"));
    }

    #[test]
    fn test_error_invalid_length() {
        let err = PrimitiveError::InvalidLength {
            expected: 12,
            got: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expected 12"));
        assert!(msg.contains("got 4"));
    }

    #[test]
    fn test_error_unknown_discriminant() {
        let err = PrimitiveError::UnknownDiscriminant(42);
        assert!(format!("{}", err).contains("42"));
    }
}
