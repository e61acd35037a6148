//! Lock-free health counters.
//!
//! A `HealthCounter` tracks how many guarded calls were made and how many of
//! them were absorbed into a fallback value. The ratio of the two is the
//! degradation signal exposed on the health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct HealthCounter {
    calls: AtomicU64,
    absorbed: AtomicU64,
}

/// Point-in-time view of a [`HealthCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HealthSnapshot {
    pub calls: u64,
    pub absorbed: u64,
    pub ratio: f64,
}

impl HealthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_absorbed(&self) {
        self.absorbed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn absorbed(&self) -> u64 {
        self.absorbed.load(Ordering::Relaxed)
    }

    /// Fraction of calls that were absorbed; `0.0` before the first call.
    pub fn ratio(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            return 0.0;
        }
        self.absorbed() as f64 / calls as f64
    }

    pub fn is_degraded(&self, threshold: f64) -> bool {
        self.absorbed() > 0 && self.ratio() >= threshold
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let calls = self.calls();
        let absorbed = self.absorbed();
        let ratio = if calls == 0 {
            0.0
        } else {
            absorbed as f64 / calls as f64
        };
        HealthSnapshot {
            calls,
            absorbed,
            ratio,
        }
    }
}
