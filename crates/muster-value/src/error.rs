//! Value codec error types

use thiserror::Error;

/// Errors from decoding a value
#[derive(Debug, Error)]
pub enum ValueError {
    /// Buffer ended before the announced length
    #[error("truncated value: needed {needed} more bytes")]
    Truncated {
        /// Missing byte count
        needed: usize,
    },

    /// Unknown type tag
    #[error("unknown value tag: {0}")]
    UnknownTag(u8),

    /// Invalid UTF-8 in a string or key
    #[error("invalid utf-8 in value")]
    InvalidUtf8,

    /// Nested length does not match its container
    #[error("inconsistent length prefix")]
    BadLength,
}

/// Result type for value operations
pub type ValueResult<T> = Result<T, ValueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(format!("{}", ValueError::Truncated { needed: 4 }).contains("4"));
        assert!(format!("{}", ValueError::UnknownTag(0xFF)).contains("255"));
        assert!(format!("{}", ValueError::InvalidUtf8).contains("utf-8"));
    }
}
