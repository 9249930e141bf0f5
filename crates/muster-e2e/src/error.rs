//! Harness error types

use thiserror::Error;

/// Errors from end-to-end scenarios
#[derive(Debug, Error)]
pub enum E2eError {
    /// A settle condition did not hold in time
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Scenario setup failed
    #[error("setup failed: {0}")]
    Setup(String),
}

/// Result type for scenarios
pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(format!("{}", E2eError::Timeout("discovery".into())).contains("discovery"));
    }
}
