//! Submission and status lookup.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use coursegen_core::{AcademicYear, IdentityKey, JobId, SubjectId, TemplateId, UserId};

use crate::guard::GuardedJobStore;

use super::store::StoreError;
use super::types::{JobStatusView, NewJob};

/// Largest accepted input payload, serialized.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// A submission as received from a caller. Ids arrive as strings and are
/// validated here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitRequest {
    pub subject_id: String,
    pub academic_year: String,
    pub template_id: String,
    pub payload: JsonValue,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("an active job already exists for {0}")]
    Conflict(IdentityKey),
    /// The store could not record the job; the caller may try again later.
    #[error("job store temporarily unavailable")]
    Unavailable,
    #[error(transparent)]
    Store(StoreError),
}

#[derive(Debug, Clone)]
pub struct JobService {
    store: GuardedJobStore,
}

impl JobService {
    pub fn new(store: GuardedJobStore) -> Self {
        Self { store }
    }

    pub fn arc(store: GuardedJobStore) -> Arc<Self> {
        Arc::new(Self::new(store))
    }

    pub fn store(&self) -> &GuardedJobStore {
        &self.store
    }

    #[instrument(skip(self, request), fields(subject_id = %request.subject_id, template_id = %request.template_id))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmitError> {
        let job = validate(request)?;
        let identity = job.identity;

        match self.store.create(job).await {
            Ok(Some(job)) => {
                info!(job_id = %job.id, priority = job.priority, "job submitted");
                Ok(job.id)
            }
            Ok(None) => {
                warn!(%identity, "submission absorbed by degradation guard");
                Err(SubmitError::Unavailable)
            }
            Err(StoreError::Conflict(identity)) => Err(SubmitError::Conflict(identity)),
            Err(e) => Err(SubmitError::Store(e)),
        }
    }

    /// `None` when the job does not exist, or when the lookup was absorbed.
    pub async fn get_status(&self, job_id: JobId) -> Result<Option<JobStatusView>, StoreError> {
        Ok(self.store.get(job_id).await?.map(|job| job.status_view()))
    }
}

fn validate(request: SubmitRequest) -> Result<NewJob, SubmitError> {
    let subject_id: SubjectId = request
        .subject_id
        .parse()
        .map_err(|_| SubmitError::Validation(format!("subject_id {:?} is not a valid id", request.subject_id)))?;
    let template_id: TemplateId = request
        .template_id
        .parse()
        .map_err(|_| SubmitError::Validation(format!("template_id {:?} is not a valid id", request.template_id)))?;
    let academic_year =
        AcademicYear::parse(&request.academic_year).map_err(|e| SubmitError::Validation(e.to_string()))?;
    let created_by = request
        .created_by
        .as_deref()
        .map(str::parse::<UserId>)
        .transpose()
        .map_err(|_| SubmitError::Validation("created_by is not a valid id".into()))?;

    if !request.payload.is_object() {
        return Err(SubmitError::Validation("payload must be a JSON object".into()));
    }
    let size = serde_json::to_vec(&request.payload)
        .map_err(|e| SubmitError::Validation(e.to_string()))?
        .len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(SubmitError::Validation(format!(
            "payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
        )));
    }

    Ok(NewJob {
        identity: IdentityKey::new(subject_id, academic_year, template_id),
        priority: request.priority,
        input_payload: request.payload,
        created_by,
    })
}
