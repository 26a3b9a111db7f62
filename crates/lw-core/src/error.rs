//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when validating domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Handle was empty after normalization
    #[error("channel handle must not be empty")]
    EmptyHandle,

    /// Handle contained characters that cannot appear in a channel login
    #[error("invalid channel handle '{handle}': {reason}")]
    InvalidHandle { handle: String, reason: String },

    /// Priority label not recognized
    #[error("invalid priority '{0}' (expected 'high' or 'normal')")]
    InvalidPriority(String),

    /// Delivery mode label not recognized
    #[error("invalid delivery mode '{0}' (expected 'push' or 'pull')")]
    InvalidDeliveryMode(String),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
