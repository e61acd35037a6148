use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coursegen_core::{AcademicYear, JobId, SubjectId, TemplateId};

use crate::error::GenerationError;

/// A single generation call, built from a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub job_id: JobId,
    pub subject_id: SubjectId,
    pub academic_year: AcademicYear,
    pub template_id: TemplateId,
    pub payload: JsonValue,
}

impl GenerationRequest {
    /// Build a request from a job's stored input.
    ///
    /// The payload was opaque while queued; here it must be a JSON object.
    /// Anything else is malformed input and will never succeed on retry.
    pub fn from_payload(
        job_id: JobId,
        subject_id: SubjectId,
        academic_year: AcademicYear,
        template_id: TemplateId,
        payload: JsonValue,
    ) -> Result<Self, GenerationError> {
        if !payload.is_object() {
            return Err(GenerationError::invalid_input(format!(
                "job {job_id}: input payload must be a JSON object"
            )));
        }
        Ok(Self {
            job_id,
            subject_id,
            academic_year,
            template_id,
            payload,
        })
    }
}

/// What the generation service produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Generated course content (stored by the artifact store).
    pub content: String,

    /// Request id assigned by the service, when it returns one.
    #[serde(default)]
    pub external_request_id: Option<String>,

    /// The raw response body, kept for diagnostics.
    #[serde(default)]
    pub raw_response: String,

    #[serde(default)]
    pub tokens_used: Option<i64>,
}

impl GenerationOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            external_request_id: None,
            raw_response: String::new(),
            tokens_used: None,
        }
    }
}
