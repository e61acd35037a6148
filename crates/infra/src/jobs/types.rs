//! Core job types and the job state machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coursegen_core::{DomainError, DomainResult, IdentityKey, JobId, UserId};

/// Lifecycle of a generation job.
///
/// Every variant is a valid combination of the business status and the queue
/// status, so the two can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, never attempted.
    Pending,
    /// Owned by a worker, not started yet.
    Claimed,
    /// Owned by a worker, generation call in progress.
    Processing,
    /// Failed transiently, eligible again once `next_retry_at` elapses.
    RetryPending,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

/// Business-facing status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Concurrency-control status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Claimed,
    Processing,
    Done,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Claimed,
        JobState::Processing,
        JobState::RetryPending,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn status(self) -> JobStatus {
        match self {
            JobState::Pending | JobState::Claimed | JobState::RetryPending => JobStatus::Pending,
            JobState::Processing => JobStatus::Running,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed => JobStatus::Failed,
        }
    }

    pub fn queue_status(self) -> QueueStatus {
        match self {
            JobState::Pending | JobState::RetryPending => QueueStatus::Pending,
            JobState::Claimed => QueueStatus::Claimed,
            JobState::Processing => QueueStatus::Processing,
            JobState::Completed | JobState::Failed => QueueStatus::Done,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether a worker currently owns the job.
    pub fn is_owned(self) -> bool {
        matches!(self, JobState::Claimed | JobState::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Processing => "processing",
            JobState::RetryPending => "retry_pending",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state {s:?}")))
    }
}

/// Exclusive, time-bounded ownership of a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub claimed_at: DateTime<Utc>,
}

/// Proof of ownership handed to the worker that won a claim.
///
/// Every write after the claim is conditioned on the token still matching the
/// stored claim. A job that was reclaimed from a stalled worker carries a new
/// `claimed_at`, so the old owner's token no longer matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub job_id: JobId,
    pub owner: String,
    pub claimed_at: DateTime<Utc>,
}

impl ClaimToken {
    /// Path-safe name for the attempt this token authorizes.
    ///
    /// Two claims on the same job never share a key: a takeover always stores
    /// a different `claimed_at` or owner.
    pub fn attempt_key(&self) -> String {
        let owner: String = self
            .owner
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}-{}", self.claimed_at.timestamp_micros(), owner)
    }
}

/// Result of a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: ClaimToken,
    /// The job was taken over from an owner whose claim went stale.
    pub reclaimed: bool,
}

/// Input to [`JobStore::create`](super::store::JobStore::create).
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub identity: IdentityKey,
    pub priority: i32,
    pub input_payload: JsonValue,
    pub created_by: Option<UserId>,
}

/// Outcome of a successful generation attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub result_reference: String,
    pub external_request_id: Option<String>,
    pub external_response_raw: Option<String>,
    pub external_response_compressed: Option<Vec<u8>>,
    pub tokens_used: Option<i64>,
}

/// Diagnostics recorded for a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub details: Option<JsonValue>,
}

impl FailureRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Re-queue; the job becomes claimable again at `next_retry_at`.
    Retry {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: FailureRecord,
    },
    /// Give up; the job becomes `Failed`.
    Terminal { retry_count: u32, error: FailureRecord },
}

impl FailureOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureOutcome::Terminal { .. })
    }

    pub fn error(&self) -> &FailureRecord {
        match self {
            FailureOutcome::Retry { error, .. } | FailureOutcome::Terminal { error, .. } => error,
        }
    }
}

/// A generation job as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub identity: IdentityKey,
    pub state: JobState,
    /// Higher is served first.
    pub priority: i32,
    pub claim: Option<Claim>,
    pub input_payload: JsonValue,
    pub result_reference: Option<String>,
    pub external_request_id: Option<String>,
    pub external_response_raw: Option<String>,
    pub external_response_compressed: Option<Vec<u8>>,
    pub tokens_used: Option<i64>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_details: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
}

impl Job {
    pub fn new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            identity: new.identity,
            state: JobState::Pending,
            priority: new.priority,
            claim: None,
            input_payload: new.input_payload,
            result_reference: None,
            external_request_id: None,
            external_response_raw: None,
            external_response_compressed: None,
            tokens_used: None,
            retry_count: 0,
            next_retry_at: None,
            error_message: None,
            error_details: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            created_by: new.created_by,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.state.queue_status()
    }

    /// Whether the job may be claimed at `now`.
    ///
    /// Returns `Some(true)` for a stale claim that may be taken over,
    /// `Some(false)` for an ordinary claim, `None` if the job is not eligible.
    pub fn claim_eligibility(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Option<bool> {
        match self.state {
            JobState::Pending => Some(false),
            JobState::RetryPending => match self.next_retry_at {
                Some(at) if at > now => None,
                _ => Some(false),
            },
            JobState::Claimed | JobState::Processing => match &self.claim {
                Some(claim) if claim.claimed_at < stale_before => Some(true),
                _ => None,
            },
            JobState::Completed | JobState::Failed => None,
        }
    }

    /// Whether `token` still describes the current claim on this job.
    pub fn is_held_by(&self, token: &ClaimToken) -> bool {
        self.id == token.job_id
            && self.state.is_owned()
            && self.claim.as_ref().is_some_and(|c| {
                c.owner == token.owner && c.claimed_at == token.claimed_at
            })
    }

    /// Take ownership of the job. Returns whether this was a stale takeover.
    pub fn claim(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let reclaimed = self.claim_eligibility(now, stale_before).ok_or_else(|| {
            DomainError::invariant(format!("job {} in state {} is not claimable", self.id, self.state))
        })?;

        self.state = JobState::Claimed;
        self.claim = Some(Claim {
            owner: owner.to_string(),
            claimed_at: now,
        });
        self.next_retry_at = None;
        Ok(reclaimed)
    }

    pub fn token(&self) -> Option<ClaimToken> {
        self.claim.as_ref().map(|c| ClaimToken {
            job_id: self.id,
            owner: c.owner.clone(),
            claimed_at: c.claimed_at,
        })
    }

    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != JobState::Claimed {
            return Err(DomainError::invariant(format!(
                "job {} cannot start processing from {}",
                self.id, self.state
            )));
        }
        self.state = JobState::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, completion: Completion, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != JobState::Processing {
            return Err(DomainError::invariant(format!(
                "job {} cannot complete from {}",
                self.id, self.state
            )));
        }
        self.state = JobState::Completed;
        self.result_reference = Some(completion.result_reference);
        self.external_request_id = completion.external_request_id;
        self.external_response_raw = completion.external_response_raw;
        self.external_response_compressed = completion.external_response_compressed;
        self.tokens_used = completion.tokens_used;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn apply_failure(&mut self, outcome: FailureOutcome, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.state.is_owned() {
            return Err(DomainError::invariant(format!(
                "job {} cannot fail from {}",
                self.id, self.state
            )));
        }

        match outcome {
            FailureOutcome::Retry {
                retry_count,
                next_retry_at,
                error,
            } => {
                if next_retry_at <= now {
                    return Err(DomainError::invariant(format!(
                        "job {}: next_retry_at must be later than the failure time",
                        self.id
                    )));
                }
                self.state = JobState::RetryPending;
                self.claim = None;
                self.retry_count = retry_count;
                self.next_retry_at = Some(next_retry_at);
                self.error_message = Some(error.message);
                self.error_details = error.details;
            }
            FailureOutcome::Terminal { retry_count, error } => {
                self.state = JobState::Failed;
                self.retry_count = retry_count;
                self.next_retry_at = None;
                self.error_message = Some(error.message);
                self.error_details = error.details;
                self.failed_at = Some(now);
            }
        }
        Ok(())
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            state: self.state,
            status: self.status(),
            queue_status: self.queue_status(),
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at,
            error: self.error_message.clone(),
            result_reference: self.result_reference.clone(),
        }
    }
}

/// Externally visible status of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    pub status: JobStatus,
    pub queue_status: QueueStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use coursegen_core::{AcademicYear, SubjectId, TemplateId};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn job() -> Job {
        let identity = IdentityKey::new(
            SubjectId::new(),
            AcademicYear::parse("2024-2025").unwrap(),
            TemplateId::new(),
        );
        Job::new(
            JobId::new(),
            NewJob {
                identity,
                priority: 0,
                input_payload: serde_json::json!({}),
                created_by: None,
            },
            t(0),
        )
    }

    #[test]
    fn derived_statuses_only_allow_valid_combinations() {
        for state in JobState::ALL {
            if matches!(state.status(), JobStatus::Completed | JobStatus::Failed) {
                assert_eq!(state.queue_status(), QueueStatus::Done, "{state}");
            }
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("archived".parse::<JobState>().is_err());
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut job = job();
        assert_eq!(job.claim_eligibility(t(1), t(-60)), Some(false));

        let reclaimed = job.claim("w1", t(1), t(-60)).unwrap();
        assert!(!reclaimed);
        assert_eq!(job.queue_status(), QueueStatus::Claimed);
        let token = job.token().unwrap();
        assert!(job.is_held_by(&token));

        job.begin_processing(t(2)).unwrap();
        assert_eq!(job.status(), JobStatus::Running);

        job.complete(
            Completion {
                result_reference: "mem://1".into(),
                ..Default::default()
            },
            t(3),
        )
        .unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.queue_status(), QueueStatus::Done);
        assert_eq!(job.claim_eligibility(t(100), t(100)), None);
    }

    #[test]
    fn retry_clears_claim_and_waits() {
        let mut job = job();
        job.claim("w1", t(1), t(-60)).unwrap();
        job.begin_processing(t(1)).unwrap();
        job.apply_failure(
            FailureOutcome::Retry {
                retry_count: 1,
                next_retry_at: t(2),
                error: FailureRecord::new("503"),
            },
            t(1),
        )
        .unwrap();

        assert_eq!(job.state, JobState::RetryPending);
        assert!(job.claim.is_none());
        assert_eq!(job.claim_eligibility(t(1), t(-60)), None);
        assert_eq!(job.claim_eligibility(t(2), t(-60)), Some(false));
    }

    #[test]
    fn retry_time_must_be_in_the_future() {
        let mut job = job();
        job.claim("w1", t(1), t(-60)).unwrap();
        let err = job
            .apply_failure(
                FailureOutcome::Retry {
                    retry_count: 1,
                    next_retry_at: t(1),
                    error: FailureRecord::new("boom"),
                },
                t(1),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn stale_claim_is_reclaimable_and_invalidates_old_token() {
        let mut job = job();
        job.claim("w1", t(0), t(-60)).unwrap();
        let old = job.token().unwrap();
        job.begin_processing(t(0)).unwrap();

        // Fresh claim is not eligible.
        assert_eq!(job.claim_eligibility(t(30), t(30) - Duration::seconds(60)), None);

        let now = t(120);
        let reclaimed = job.claim("w2", now, now - Duration::seconds(60)).unwrap();
        assert!(reclaimed);
        assert!(!job.is_held_by(&old));
        let current = job.token().unwrap();
        assert!(job.is_held_by(&current));
        assert_ne!(current.attempt_key(), old.attempt_key());
    }

    #[test]
    fn terminal_failure_records_error() {
        let mut job = job();
        job.claim("w1", t(0), t(-60)).unwrap();
        job.begin_processing(t(0)).unwrap();
        job.apply_failure(
            FailureOutcome::Terminal {
                retry_count: 3,
                error: FailureRecord::new("exhausted"),
            },
            t(5),
        )
        .unwrap();

        let view = job.status_view();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.queue_status, QueueStatus::Done);
        assert_eq!(view.error.as_deref(), Some("exhausted"));
        assert!(view.next_retry_at.is_none());
        assert_eq!(job.failed_at, Some(t(5)));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut job = job();
        assert!(job.begin_processing(t(0)).is_err());
        assert!(job.complete(Completion::default(), t(0)).is_err());
        assert!(
            job.apply_failure(
                FailureOutcome::Terminal {
                    retry_count: 0,
                    error: FailureRecord::new("x")
                },
                t(0)
            )
            .is_err()
        );
    }
}
