use async_trait::async_trait;

use crate::error::GenerationError;
use crate::request::{GenerationOutput, GenerationRequest};

/// An external service that turns a request into generated content.
///
/// Implementations must not retry internally; retry scheduling belongs to the
/// job queue so that backoff and the circuit breaker see every failure.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Name of the dependency, used to select its circuit breaker.
    fn dependency(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError>;
}
