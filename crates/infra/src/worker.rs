//! Worker pool: claim, generate, record.
//!
//! Each worker loops independently:
//!
//! 1. claim the next eligible job (or sleep `poll_interval` when there is none)
//! 2. move it to `Processing`
//! 3. call the generation service through the dependency's circuit breaker
//! 4. store the artifact and complete the job, or hand the failure to the
//!    retry policy
//!
//! Every write after the claim carries the claim token, and artifacts are keyed
//! by it. A worker that lost its claim to a stale-claim takeover gets
//! `ClaimLost` and drops the job; its artifact is written beside the new
//! owner's, never over it.
//!
//! The takeover itself is charged to the job as a transient failure, so it
//! is re-queued with backoff before the next attempt.
//!
//! Shutdown is cooperative: a cancelled worker finishes the job it holds and
//! then exits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use coursegen_ai::{GenerationClient, GenerationError, GenerationOutput, GenerationRequest};

use crate::artifacts::{ArtifactStore, encode_response};
use crate::breaker::{BreakerError, BreakerRegistry};
use crate::clock::Clock;
use crate::guard::GuardedJobStore;
use crate::jobs::retry::{FailureClass, RetryPolicy};
use crate::jobs::store::StoreError;
use crate::jobs::types::{ClaimToken, Completion, FailureRecord, Job, JobState};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Claims older than this are considered abandoned and may be taken over.
    pub claim_ttl: Duration,
    pub name_prefix: String,
    /// Raw responses at least this large are stored gzipped.
    pub compress_threshold_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            claim_ttl: Duration::from_secs(15 * 60),
            name_prefix: "coursegen-worker".to_string(),
            compress_threshold_bytes: 16 * 1024,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Unique id for worker `index` of this process.
    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-{}-{}", self.name_prefix, index, uuid::Uuid::now_v7())
    }
}

/// What a single [`Worker::process_one`] pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was claimable.
    Idle,
    Completed,
    /// The attempt failed and the job was re-queued with backoff.
    Retrying,
    /// The attempt failed and the job is now terminally `Failed`.
    Failed,
    /// Another worker took the job over; our result was discarded.
    ClaimLost,
    /// A store call was absorbed by the degradation guard; the job's state is unknown.
    Absorbed,
}

/// Runtime counters for the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub lost_claims: u64,
    pub absorbed: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        if outcome == ProcessOutcome::Idle {
            return;
        }
        self.processed += 1;
        match outcome {
            ProcessOutcome::Completed => self.completed += 1,
            ProcessOutcome::Retrying => self.retried += 1,
            ProcessOutcome::Failed => self.failed += 1,
            ProcessOutcome::ClaimLost => self.lost_claims += 1,
            ProcessOutcome::Absorbed => self.absorbed += 1,
            ProcessOutcome::Idle => {}
        }
    }
}

/// Everything a worker needs; cheap to clone, shared by the whole pool.
#[derive(Clone)]
pub struct Worker {
    store: GuardedJobStore,
    client: Arc<dyn GenerationClient>,
    breakers: Arc<BreakerRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stats: Arc<Mutex<PoolStats>>,
}

/// A failed generation attempt, classified for the retry policy.
struct AttemptFailure(FailureClass, FailureRecord);

impl Worker {
    pub fn new(
        store: GuardedJobStore,
        client: Arc<dyn GenerationClient>,
        breakers: Arc<BreakerRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            client,
            breakers,
            artifacts,
            retry,
            clock,
            config,
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.config.claim_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Claim and run at most one job.
    #[instrument(skip(self), fields(job_id = tracing::field::Empty))]
    pub async fn process_one(&self, worker_id: &str) -> Result<ProcessOutcome, StoreError> {
        let outcome = self.process_inner(worker_id).await;
        if let Ok(outcome) = &outcome {
            self.stats
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .record(*outcome);
        }
        outcome
    }

    async fn process_inner(&self, worker_id: &str) -> Result<ProcessOutcome, StoreError> {
        let now = self.clock.now();
        let Some(claimed) = self
            .store
            .claim_next(worker_id, now, self.stale_before(now))
            .await?
        else {
            return Ok(ProcessOutcome::Idle);
        };

        let token = claimed.token;
        tracing::Span::current().record("job_id", tracing::field::display(token.job_id));
        if claimed.reclaimed {
            // The abandoned attempt counts against the retry budget, so a job
            // that keeps stalling its worker still ends up failed.
            warn!(retry_count = claimed.job.retry_count, "took over job with stale claim");
            let record = FailureRecord::new("previous attempt abandoned with a stale claim")
                .with_details(json!({ "kind": "abandoned" }));
            return self
                .record_failure(&token, &claimed.job, FailureClass::Transient, record)
                .await;
        }

        let job = match self.store.start_processing(&token, self.clock.now()).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(ProcessOutcome::Absorbed),
            Err(StoreError::ClaimLost(_)) => return Ok(lost(&token)),
            Err(e) => return Err(e),
        };

        match self.attempt(&job, &token).await {
            Ok(completion) => self.finish(&token, completion).await,
            Err(AttemptFailure(class, record)) => self.record_failure(&token, &job, class, record).await,
        }
    }

    async fn attempt(&self, job: &Job, token: &ClaimToken) -> Result<Completion, AttemptFailure> {
        let request = GenerationRequest::from_payload(
            job.id,
            job.identity.subject_id,
            job.identity.academic_year,
            job.identity.template_id,
            job.input_payload.clone(),
        )
        .map_err(|e| AttemptFailure(FailureClass::NonRecoverable, generation_failure(&e)))?;

        let output = self.generate(&request).await?;

        let result_reference = self
            .artifacts
            .put(token, &output.content)
            .await
            .map_err(|e| {
                AttemptFailure(
                    FailureClass::Transient,
                    FailureRecord::new(e.to_string()).with_details(json!({ "kind": "artifact_store" })),
                )
            })?;

        let stored = encode_response(&output.raw_response, self.config.compress_threshold_bytes).unwrap_or_else(|e| {
            warn!(error = %e, "could not compress raw response, dropping it");
            Default::default()
        });

        Ok(Completion {
            result_reference,
            external_request_id: output.external_request_id,
            external_response_raw: stored.raw,
            external_response_compressed: stored.compressed,
            tokens_used: output.tokens_used,
        })
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, AttemptFailure> {
        let dependency = self.client.dependency();
        let breaker = self.breakers.get(dependency);

        breaker
            .call(self.client.generate(request), GenerationError::is_transient)
            .await
            .map_err(|err| match err {
                BreakerError::Open { dependency } => {
                    debug!(%dependency, "circuit open, skipping call");
                    AttemptFailure(
                        FailureClass::Transient,
                        FailureRecord::new(format!("circuit open for {dependency}"))
                            .with_details(json!({ "kind": "circuit_open", "dependency": dependency })),
                    )
                }
                BreakerError::Timeout { dependency, after } => AttemptFailure(
                    FailureClass::Transient,
                    FailureRecord::new(format!("call to {dependency} timed out after {after:?}"))
                        .with_details(json!({ "kind": "timeout", "dependency": dependency })),
                ),
                BreakerError::Inner(e) => {
                    let class = if e.is_transient() {
                        FailureClass::Transient
                    } else {
                        FailureClass::NonRecoverable
                    };
                    AttemptFailure(class, generation_failure(&e))
                }
            })
    }

    async fn finish(&self, token: &ClaimToken, completion: Completion) -> Result<ProcessOutcome, StoreError> {
        match self.store.complete(token, completion, self.clock.now()).await {
            Ok(Some(job)) => {
                info!(result_reference = ?job.result_reference, "job completed");
                Ok(ProcessOutcome::Completed)
            }
            Ok(None) => Ok(ProcessOutcome::Absorbed),
            Err(StoreError::ClaimLost(_)) => Ok(lost(token)),
            Err(e) => Err(e),
        }
    }

    async fn record_failure(
        &self,
        token: &ClaimToken,
        job: &Job,
        class: FailureClass,
        record: FailureRecord,
    ) -> Result<ProcessOutcome, StoreError> {
        let now = self.clock.now();
        let outcome = self.retry.decide(job.retry_count, class, record, now);

        match self.store.fail(token, outcome, now).await {
            Ok(Some(job)) if job.state == JobState::Failed => {
                warn!(
                    retry_count = job.retry_count,
                    error = ?job.error_message,
                    "job failed permanently"
                );
                Ok(ProcessOutcome::Failed)
            }
            Ok(Some(job)) => {
                info!(
                    retry_count = job.retry_count,
                    next_retry_at = ?job.next_retry_at,
                    error = ?job.error_message,
                    "job scheduled for retry"
                );
                Ok(ProcessOutcome::Retrying)
            }
            Ok(None) => Ok(ProcessOutcome::Absorbed),
            Err(StoreError::ClaimLost(_)) => Ok(lost(token)),
            Err(e) => Err(e),
        }
    }

    async fn run(self, worker_id: String, shutdown: CancellationToken) {
        info!(%worker_id, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let idle = match self.process_one(&worker_id).await {
                Ok(ProcessOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(%worker_id, error = %e, "job store error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(%worker_id, "worker stopped");
    }
}

fn lost(token: &ClaimToken) -> ProcessOutcome {
    warn!(owner = %token.owner, "claim lost to another worker, discarding result");
    ProcessOutcome::ClaimLost
}

fn generation_failure(err: &GenerationError) -> FailureRecord {
    let kind = match err {
        GenerationError::Transient(_) => "transient",
        GenerationError::RateLimited(_) => "rate_limited",
        GenerationError::InvalidInput(_) => "invalid_input",
        GenerationError::Rejected { .. } => "rejected",
        GenerationError::Decode(_) => "decode",
    };
    let mut details = json!({ "kind": kind });
    if let GenerationError::Rejected { status, .. } = err {
        details["status"] = json!(status);
    }
    FailureRecord::new(err.to_string()).with_details(details)
}

/// A set of worker tasks sharing one [`Worker`].
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.worker_count` workers onto the current runtime.
    pub fn spawn(worker: Worker) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let stats = worker.stats.clone();

        let tasks = (0..worker.config.worker_count)
            .map(|index| {
                let worker_id = worker.config.worker_id(index);
                tokio::spawn(worker.clone().run(worker_id, shutdown.child_token()))
            })
            .collect::<Vec<_>>();

        info!(workers = tasks.len(), "worker pool started");
        WorkerPoolHandle { shutdown, tasks, stats }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming, let in-flight jobs finish, and wait for every worker.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::Value as JsonValue;
    use tokio::sync::Notify;

    use coursegen_core::{AcademicYear, IdentityKey, JobId, SubjectId, TemplateId};

    use crate::artifacts::InMemoryArtifactStore;
    use crate::breaker::BreakerConfig;
    use crate::clock::ManualClock;
    use crate::guard::DegradationGuard;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::NewJob;

    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<GenerationOutput, GenerationError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn with(script: Vec<Result<GenerationOutput, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        fn dependency(&self) -> &str {
            "generation"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(GenerationOutput::new(format!("# course for {}", request.job_id))))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryJobStore>,
        artifacts: Arc<InMemoryArtifactStore>,
        worker: Worker,
    }

    /// First call blocks until released; later calls return at once.
    #[derive(Default)]
    struct GatedClient {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl GenerationClient for GatedClient {
        fn dependency(&self) -> &str {
            "generation"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
                return Ok(GenerationOutput::new("# stale attempt"));
            }
            Ok(GenerationOutput::new("# retried attempt"))
        }
    }

    fn fixture(client: Arc<dyn GenerationClient>, breaker: BreakerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()));
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let worker = Worker::new(
            GuardedJobStore::new(store.clone(), DegradationGuard::new()),
            client,
            Arc::new(BreakerRegistry::new(breaker)),
            artifacts.clone(),
            RetryPolicy::exponential(3, Duration::from_secs(1), 2.0),
            clock.clone(),
            WorkerConfig::default().with_claim_ttl(Duration::from_secs(300)),
        );
        Fixture {
            clock,
            store,
            artifacts,
            worker,
        }
    }

    async fn submit(store: &InMemoryJobStore, payload: JsonValue) -> JobId {
        let identity = IdentityKey::new(
            SubjectId::new(),
            AcademicYear::parse("2025-2026").unwrap(),
            TemplateId::new(),
        );
        store
            .create(NewJob {
                identity,
                priority: 0,
                input_payload: payload,
                created_by: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn completes_job_and_stores_artifact() {
        let mut output = GenerationOutput::new("# Algebra I");
        output.external_request_id = Some("req-1".into());
        output.raw_response = "{\"id\":\"req-1\"}".into();
        output.tokens_used = Some(812);
        let f = fixture(ScriptedClient::with(vec![Ok(output)]), BreakerConfig::default());
        let id = submit(&f.store, json!({ "weeks": 12 })).await;

        let outcome = f.worker.process_one("w-1").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.tokens_used, Some(812));
        assert_eq!(job.external_request_id.as_deref(), Some("req-1"));
        assert_eq!(job.external_response_raw.as_deref(), Some("{\"id\":\"req-1\"}"));
        let reference = job.result_reference.unwrap();
        assert_eq!(f.artifacts.resolve(&reference).as_deref(), Some("# Algebra I"));
        assert_eq!(f.worker.stats().completed, 1);
    }

    #[tokio::test]
    async fn idle_when_nothing_is_queued() {
        let f = fixture(ScriptedClient::with(vec![]), BreakerConfig::default());
        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(f.worker.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry_with_backoff() {
        let client = ScriptedClient::with(vec![Err(GenerationError::transient("503 from upstream"))]);
        let f = fixture(client.clone(), BreakerConfig::default());
        let id = submit(&f.store, json!({})).await;
        let failed_at = f.clock.now();

        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Retrying);
        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::RetryPending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.next_retry_at, Some(failed_at + TimeDelta::seconds(1)));
        assert!(job.error_message.unwrap().contains("503"));

        // Not eligible until the backoff elapses.
        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Idle);
        f.clock.advance(TimeDelta::seconds(1));
        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Completed);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn rejected_request_fails_without_retry() {
        let client = ScriptedClient::with(vec![Err(GenerationError::Rejected {
            status: 422,
            message: "unknown template".into(),
        })]);
        let f = fixture(client, BreakerConfig::default());
        let id = submit(&f.store, json!({})).await;

        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Failed);
        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error_details.unwrap()["status"], 422);
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_the_service() {
        let client = ScriptedClient::with(vec![]);
        let f = fixture(client.clone(), BreakerConfig::default());
        let id = submit(&f.store, json!(["not", "an", "object"])).await;

        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Failed);
        assert_eq!(client.calls(), 0);
        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.error_details.unwrap()["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn open_breaker_requeues_without_calling() {
        let client = ScriptedClient::with(vec![Err(GenerationError::transient("connection reset"))]);
        let breaker = BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        };
        let f = fixture(client.clone(), breaker);
        submit(&f.store, json!({})).await;
        let second = submit(&f.store, json!({})).await;

        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Retrying);
        assert_eq!(f.worker.process_one("w-1").await.unwrap(), ProcessOutcome::Retrying);
        assert_eq!(client.calls(), 1);

        let job = f.store.get(second).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::RetryPending);
        assert_eq!(job.error_details.unwrap()["kind"], "circuit_open");
    }

    #[tokio::test]
    async fn late_attempt_cannot_replace_committed_artifact() {
        let client = Arc::new(GatedClient::default());
        let f = fixture(client.clone(), BreakerConfig::default());
        let id = submit(&f.store, json!({})).await;

        let slow = {
            let worker = f.worker.clone();
            tokio::spawn(async move { worker.process_one("slow").await })
        };
        client.entered.notified().await;

        // Claim goes stale while "slow" is stuck in the call.
        f.clock.advance(TimeDelta::seconds(301));
        assert_eq!(f.worker.process_one("fast").await.unwrap(), ProcessOutcome::Retrying);
        f.clock.advance(TimeDelta::seconds(1));
        assert_eq!(f.worker.process_one("fast").await.unwrap(), ProcessOutcome::Completed);
        let committed = f.store.get(id).await.unwrap().unwrap().result_reference.unwrap();

        client.release.notify_one();
        assert_eq!(slow.await.unwrap().unwrap(), ProcessOutcome::ClaimLost);

        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_reference.as_deref(), Some(committed.as_str()));
        assert_eq!(f.artifacts.resolve(&committed).as_deref(), Some("# retried attempt"));
        assert_eq!(f.artifacts.len(), 2);
        assert_eq!(f.worker.stats().lost_claims, 1);
    }

    #[tokio::test]
    async fn abandoned_claims_count_against_retries() {
        let client = ScriptedClient::with(vec![]);
        let f = fixture(client.clone(), BreakerConfig::default());
        let id = submit(&f.store, json!({})).await;

        let mut outcomes = Vec::new();
        for attempt in 0..4 {
            // A worker claims the job and dies mid-call.
            let now = f.clock.now();
            let claimed = f
                .store
                .claim_next(&format!("dead-{attempt}"), now, now)
                .await
                .unwrap()
                .unwrap();
            f.store.start_processing(&claimed.token, now).await.unwrap();

            f.clock.advance(TimeDelta::seconds(301));
            outcomes.push(f.worker.process_one("w-1").await.unwrap());
            f.clock.advance(TimeDelta::seconds(60));
        }

        assert_eq!(
            outcomes,
            vec![
                ProcessOutcome::Retrying,
                ProcessOutcome::Retrying,
                ProcessOutcome::Retrying,
                ProcessOutcome::Failed
            ]
        );
        assert_eq!(client.calls(), 0);
        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error_details.unwrap()["kind"], "abandoned");
    }

    #[tokio::test]
    async fn worker_ids_are_unique() {
        let config = WorkerConfig::default().with_name_prefix("gen");
        let a = config.worker_id(0);
        let b = config.worker_id(0);
        assert!(a.starts_with("gen-0-"));
        assert_ne!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_drains_queue_and_shuts_down() {
        let client = ScriptedClient::with(vec![]);
        let mut f = fixture(client, BreakerConfig::default());
        f.worker.config = f
            .worker
            .config
            .clone()
            .with_worker_count(3)
            .with_poll_interval(Duration::from_millis(10));
        for _ in 0..5 {
            submit(&f.store, json!({})).await;
        }

        let pool = WorkerPool::spawn(f.worker.clone());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pool.stats().completed < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pool.stats().completed, 5);
        assert_eq!(f.store.stats().await.unwrap().completed, 5);
        pool.shutdown().await;
    }
}
