//! Tracing, logging, health metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Health counters shared by the store guard and the health endpoint.
pub mod metrics;

pub use metrics::{HealthCounter, HealthSnapshot};
pub use tracing::{LogFormat, ParseLogFormatError};
