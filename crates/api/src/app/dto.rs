use std::collections::BTreeMap;

use serde::Serialize;

use coursegen_core::JobId;
use coursegen_infra::CircuitState;
use coursegen_infra::jobs::JobStats;
use coursegen_observability::HealthSnapshot;

// Request bodies are `coursegen_infra::jobs::SubmitRequest`.

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: HealthSnapshot,
    pub breakers: BTreeMap<String, CircuitState>,
    /// Absent when the store could not be queried.
    pub jobs: Option<JobStats>,
}
