//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when interpreting domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Extension text was empty, non-numeric, or out of range
    #[error("Invalid extension '{value}': {reason}")]
    InvalidExtension { value: String, reason: String },

    /// State name did not match any telephone unit state
    #[error("Unknown unit state: {0}")]
    UnknownState(String),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
