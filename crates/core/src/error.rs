//! Shared error model.

use thiserror::Error;

/// Result type used by the core vocabulary.
pub type CoreResult<T> = Result<T, CoreError>;

/// Validation failures for identifiers and wire values.
///
/// Infrastructure failures (broker, store, pub/sub) have their own error
/// types in `agentexec-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. empty or oversized input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
