//! # Error Handling Framework
//!
//! Structured error types for the runtime core plus retry logic with
//! exponential backoff. Each crate in the workspace defines its own error
//! enum; the variants here cover concerns that do not belong to a single
//! subsystem (configuration and validation of the runtime itself).

pub mod retry;

pub use retry::{retry_with_policy, RetryOutcome, RetryPolicy};

use serde::{Deserialize, Serialize};

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Error types for the runtime core
#[derive(Debug, thiserror::Error, Clone)]
pub enum CoreError {
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Informational - no action required
    Info,
    /// Warning - should be investigated
    Warning,
    /// Error - requires attention
    Error,
    /// Critical - immediate action required
    Critical,
}

/// Error categories for classification and handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Transient errors that may succeed on retry
    Transient,
    /// Permanent errors that won't succeed on retry
    Permanent,
    /// User errors (bad input, validation failures)
    User,
    /// System errors (infrastructure, dependencies)
    System,
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::ConfigurationError { .. } => ErrorCategory::User,
            CoreError::ValidationError { .. } => ErrorCategory::User,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CoreError::ConfigurationError { .. } => ErrorSeverity::Error,
            CoreError::ValidationError { .. } => ErrorSeverity::Warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let err = CoreError::ConfigurationError {
            message: "missing database path".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::User);
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::ValidationError {
            message: "bad input".to_string(),
        };
        assert_eq!(format!("{}", err), "Validation error: bad input");
    }
}
