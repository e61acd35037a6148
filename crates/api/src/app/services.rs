use std::sync::Arc;

use coursegen_infra::jobs::{InMemoryJobStore, JobService, JobStore};
use coursegen_infra::{BreakerConfig, BreakerRegistry, DegradationGuard, GuardedJobStore};

/// Absorbed-call ratio above which `/health` reports `degraded`.
pub const DEGRADED_RATIO: f64 = 0.05;

/// Shared state for HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub jobs: Arc<JobService>,
    pub breakers: Arc<BreakerRegistry>,
}

impl AppServices {
    pub fn new(jobs: Arc<JobService>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { jobs, breakers }
    }

    /// Services over `store`, guarded, with default breakers.
    pub fn over(store: Arc<dyn JobStore>) -> Self {
        let guarded = GuardedJobStore::new(store, DegradationGuard::new());
        Self::new(
            JobService::arc(guarded),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        )
    }

    /// In-memory services for local runs and tests.
    pub fn in_memory() -> Self {
        Self::over(InMemoryJobStore::arc())
    }

    pub fn guard(&self) -> &DegradationGuard {
        self.jobs.store().guard()
    }
}
