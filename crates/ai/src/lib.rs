//! `coursegen-ai`
//!
//! **Responsibility:** boundary to the external AI generation service.
//!
//! This crate is intentionally **not** part of the queue machinery:
//! - It knows nothing about claims, retries or the job store.
//! - It turns a job's input into a [`GenerationRequest`] and returns a
//!   [`GenerationOutput`] or a classified [`GenerationError`].
//! - Callers wrap every call in a circuit breaker and a timeout.

pub mod client;
pub mod error;
pub mod http;
pub mod request;

pub use client::GenerationClient;
pub use error::GenerationError;
pub use http::{HttpGenerationClient, HttpGenerationConfig};
pub use request::{GenerationOutput, GenerationRequest};
