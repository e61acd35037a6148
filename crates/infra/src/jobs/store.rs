//! Job storage abstraction and the in-memory implementation.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use coursegen_core::{IdentityKey, JobId};

use crate::clock::{Clock, SystemClock};

use super::types::{ClaimToken, ClaimedJob, Completion, FailureOutcome, Job, JobState, NewJob};

/// Job store abstraction.
///
/// After `create`, every mutation is a conditional transition: claims are
/// guarded by the pre-claim state, and every later write by the caller's
/// [`ClaimToken`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` job.
    ///
    /// Fails with [`StoreError::Conflict`] if a non-terminal job already owns
    /// the identity key.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically claim the next eligible job for `owner`.
    ///
    /// Eligible: `Pending`, `RetryPending` whose `next_retry_at <= now`, and
    /// owned jobs whose `claimed_at < stale_before`. Ordered by priority
    /// (descending) then creation time (ascending). Returns `None` if nothing
    /// is eligible.
    async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError>;

    /// `Claimed → Processing`, only while `token` holds the claim.
    async fn start_processing(&self, token: &ClaimToken, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// `Processing → Completed`, only while `token` holds the claim.
    async fn complete(
        &self,
        token: &ClaimToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// `Claimed | Processing → RetryPending | Failed`, only while `token` holds the claim.
    async fn fail(
        &self,
        token: &ClaimToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// List jobs, optionally filtered by state, oldest first.
    async fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Structural mismatch between the code and the live store schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaDrift {
    #[error("missing column: {0}")]
    MissingColumn(String),
    #[error("missing table: {0}")]
    MissingTable(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unknown enum value: {0}")]
    UnknownEnumValue(String),
}

impl SchemaDrift {
    /// Last-resort classification of an unstructured error message.
    ///
    /// Only used when the store driver gives no error code.
    pub fn from_message(message: &str) -> Option<Self> {
        let lower = message.to_ascii_lowercase();
        if lower.contains("column") && (lower.contains("does not exist") || lower.contains("not found")) {
            Some(Self::MissingColumn(message.to_string()))
        } else if lower.contains("relation") && lower.contains("does not exist") {
            Some(Self::MissingTable(message.to_string()))
        } else if lower.contains("invalid input value for enum") {
            Some(Self::UnknownEnumValue(message.to_string()))
        } else if lower.contains("mismatched types") || lower.contains("is of type") {
            Some(Self::TypeMismatch(message.to_string()))
        } else {
            None
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("an active job already exists for {0}")]
    Conflict(IdentityKey),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("claim on job {0} is no longer held")]
    ClaimLost(JobId),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaDrift),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub claimed: usize,
    pub processing: usize,
    pub retry_pending: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: usize) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Claimed => &mut self.claimed,
            JobState::Processing => &mut self.processing,
            JobState::RetryPending => &mut self.retry_pending,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.processing + self.retry_pending + self.completed + self.failed
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex covers the whole table, so the select and the update of a
/// claim happen in one critical section.
pub struct InMemoryJobStore {
    inner: Mutex<Table>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Table {
    jobs: HashMap<JobId, Job>,
    /// Insertion order, the final tie-break after priority and `created_at`.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for `created_at` of new jobs.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Table::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // The table is only mutated after a transition has been validated, so a
        // poisoned lock still guards consistent data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `transition` to the job only if `token` still holds it.
    fn with_claim<F>(&self, token: &ClaimToken, transition: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        let mut table = self.table();
        let job = table
            .jobs
            .get_mut(&token.job_id)
            .ok_or(StoreError::NotFound(token.job_id))?;

        if !job.is_held_by(token) {
            return Err(StoreError::ClaimLost(token.job_id));
        }

        let mut next = job.clone();
        transition(&mut next)?;
        *job = next.clone();
        Ok(next)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &self.table().jobs.len())
            .finish()
    }
}

fn invalid(err: coursegen_core::DomainError) -> StoreError {
    StoreError::InvalidTransition(err.to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut table = self.table();
        if table
            .jobs
            .values()
            .any(|j| j.identity == new.identity && !j.state.is_terminal())
        {
            return Err(StoreError::Conflict(new.identity));
        }

        let job = Job::new(JobId::new(), new, self.clock.now());
        let seq = table.next_seq;
        table.next_seq += 1;
        table.seq.insert(job.id, seq);
        table.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.table().jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let mut table = self.table();
        let Table { jobs, seq, .. } = &mut *table;

        let next_id = jobs
            .values()
            .filter(|j| j.claim_eligibility(now, stale_before).is_some())
            .min_by_key(|j| (Reverse(j.priority), j.created_at, seq.get(&j.id).copied()))
            .map(|j| j.id);

        let Some(job_id) = next_id else {
            return Ok(None);
        };
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let reclaimed = job.claim(owner, now, stale_before).map_err(invalid)?;
        let token = job
            .token()
            .ok_or_else(|| StoreError::InvalidTransition(format!("job {job_id} claimed without owner")))?;

        Ok(Some(ClaimedJob {
            job: job.clone(),
            token,
            reclaimed,
        }))
    }

    async fn start_processing(&self, token: &ClaimToken, now: DateTime<Utc>) -> Result<Job, StoreError> {
        self.with_claim(token, |job| job.begin_processing(now).map_err(invalid))
    }

    async fn complete(
        &self,
        token: &ClaimToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.with_claim(token, |job| job.complete(completion, now).map_err(invalid))
    }

    async fn fail(
        &self,
        token: &ClaimToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.with_claim(token, |job| job.apply_failure(outcome, now).map_err(invalid))
    }

    async fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let table = self.table();
        let mut result: Vec<_> = table
            .jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::default();
        for job in self.table().jobs.values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id).await
    }

    async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        (**self).claim_next(owner, now, stale_before).await
    }

    async fn start_processing(&self, token: &ClaimToken, now: DateTime<Utc>) -> Result<Job, StoreError> {
        (**self).start_processing(token, now).await
    }

    async fn complete(
        &self,
        token: &ClaimToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        (**self).complete(token, completion, now).await
    }

    async fn fail(
        &self,
        token: &ClaimToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        (**self).fail(token, outcome, now).await
    }

    async fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_by_state(state, limit).await
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats().await
    }
}
