use thiserror::Error;

/// Failure of a call to the generation service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// Network failure, 5xx or any other condition worth retrying.
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// The service asked us to slow down (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The job input cannot be turned into a valid request.
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    /// The service rejected the request (4xx other than 429).
    #[error("generation rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The service answered 2xx with a body we could not decode.
    #[error("undecodable generation response: {0}")]
    Decode(String),
}

impl GenerationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether another attempt could succeed without changing the input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}
