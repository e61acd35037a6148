//! Errors raised by domain values and job transitions.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A rule of the job domain was broken.
///
/// Storage, network and configuration failures have their own error types in
/// the crates that own them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: a bad academic year, a backoff multiplier below one.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An illegal job transition, e.g. completing a job nobody claimed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A string that should have been an id was not.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
