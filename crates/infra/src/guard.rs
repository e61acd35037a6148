//! Degradation guard around job store calls.
//!
//! A store whose live schema has drifted from what this code expects (a column
//! dropped or renamed by a migration in flight, an unknown state value) must not
//! take the workers down. The guard absorbs [`StoreError::SchemaMismatch`] into
//! a safe default and counts it; every other error propagates unchanged.
//!
//! Absorbed results are possibly incomplete. An empty claim or a missing job
//! returned through the guard is never proof that nothing exists.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use coursegen_core::JobId;
use coursegen_observability::{HealthCounter, HealthSnapshot};

use crate::jobs::store::{JobStats, JobStore, StoreError};
use crate::jobs::types::{ClaimToken, ClaimedJob, Completion, FailureOutcome, Job, JobState, NewJob};

#[derive(Debug, Clone, Default)]
pub struct DegradationGuard {
    health: Arc<HealthCounter>,
}

impl DegradationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn counter(&self) -> &Arc<HealthCounter> {
        &self.health
    }

    /// Run `call`, substituting `default` if it fails with schema drift.
    pub async fn absorb<T, F>(&self, operation: &'static str, default: T, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.health.record_call();
        match call.await {
            Ok(value) => Ok(value),
            Err(StoreError::SchemaMismatch(drift)) => {
                self.health.record_absorbed();
                warn!(
                    operation,
                    drift = %drift,
                    absorbed_ratio = self.health.ratio(),
                    "store schema drift absorbed"
                );
                Ok(default)
            }
            Err(other) => Err(other),
        }
    }
}

/// A [`JobStore`] whose every call passes through a [`DegradationGuard`].
///
/// Operations that would return a value return `Option`/empty defaults when
/// the call was absorbed.
#[derive(Clone)]
pub struct GuardedJobStore {
    inner: Arc<dyn JobStore>,
    guard: DegradationGuard,
}

impl GuardedJobStore {
    pub fn new(inner: Arc<dyn JobStore>, guard: DegradationGuard) -> Self {
        Self { inner, guard }
    }

    pub fn guard(&self) -> &DegradationGuard {
        &self.guard
    }

    /// `None` when the insert was absorbed.
    pub async fn create(&self, job: NewJob) -> Result<Option<Job>, StoreError> {
        self.guard
            .absorb("create", None, async { self.inner.create(job).await.map(Some) })
            .await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.guard.absorb("get", None, self.inner.get(job_id)).await
    }

    pub async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        self.guard
            .absorb("claim_next", None, self.inner.claim_next(owner, now, stale_before))
            .await
    }

    pub async fn start_processing(&self, token: &ClaimToken, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        self.guard
            .absorb("start_processing", None, async {
                self.inner.start_processing(token, now).await.map(Some)
            })
            .await
    }

    pub async fn complete(
        &self,
        token: &ClaimToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.guard
            .absorb("complete", None, async {
                self.inner.complete(token, completion, now).await.map(Some)
            })
            .await
    }

    pub async fn fail(
        &self,
        token: &ClaimToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.guard
            .absorb("fail", None, async { self.inner.fail(token, outcome, now).await.map(Some) })
            .await
    }

    pub async fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.guard
            .absorb("list_by_state", Vec::new(), self.inner.list_by_state(state, limit))
            .await
    }

    pub async fn stats(&self) -> Result<JobStats, StoreError> {
        self.guard
            .absorb("stats", JobStats::default(), self.inner.stats())
            .await
    }
}

impl std::fmt::Debug for GuardedJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedJobStore")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}
