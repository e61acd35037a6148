//! HTTP API: job submission, status lookup and health.

pub mod app;
