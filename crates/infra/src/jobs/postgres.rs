//! Postgres-backed job store.
//!
//! ## Claim protocol
//!
//! `claim_next` is one statement: a CTE selects the best eligible row with
//! `FOR UPDATE SKIP LOCKED` and the outer `UPDATE` claims it. Two workers can
//! never claim the same row, and a worker never blocks on a row another worker
//! is claiming.
//!
//! Every later write (`start_processing`, `complete`, `fail`) repeats the
//! caller's claim in its `WHERE` clause (`claim_owner` and `claimed_at`). When a
//! stalled job has been reclaimed, the original owner's write matches zero rows
//! and is reported as [`StoreError::ClaimLost`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` (on `create`) |
//! | Database (undefined column) | `42703` | `SchemaMismatch(MissingColumn)` |
//! | Database (undefined table) | `42P01` | `SchemaMismatch(MissingTable)` |
//! | Database (datatype mismatch) | `42804` | `SchemaMismatch(TypeMismatch)` |
//! | Database (invalid text representation) | `22P02` | `SchemaMismatch(UnknownEnumValue)` |
//! | ColumnNotFound | N/A | `SchemaMismatch(MissingColumn)` |
//! | ColumnDecode | N/A | `SchemaMismatch(TypeMismatch)` |
//! | Other | Any other | `Database` (or drift, if the message says so) |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use coursegen_core::{AcademicYear, IdentityKey, JobId, SubjectId, TemplateId, UserId};

use super::store::{JobStats, JobStore, SchemaDrift, StoreError};
use super::types::{Claim, ClaimToken, ClaimedJob, Completion, FailureOutcome, Job, JobState, NewJob};

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync` and cheap to clone; all operations go
/// through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn guarded_update(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        job_id: JobId,
    ) -> Result<Job, StoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error(operation, e))?
                .try_into(),
            None => Err(StoreError::ClaimLost(job_id)),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(subject_id = %job.identity.subject_id, template_id = %job.identity.template_id), err)]
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let identity = job.identity;
        let row = sqlx::query(
            r#"
            INSERT INTO generation_jobs
                (id, subject_id, academic_year, template_id, state, priority, input_payload, created_by, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::from(JobId::new()))
        .bind(Uuid::from(identity.subject_id))
        .bind(identity.academic_year.to_string())
        .bind(Uuid::from(identity.template_id))
        .bind(job.priority)
        .bind(&job.input_payload)
        .bind(job.created_by.map(Uuid::from))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(identity)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("create", e))?
            .try_into()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM generation_jobs WHERE id = $1")
            .bind(Uuid::from(job_id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| -> Result<Job, StoreError> {
            JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error("get", e))?
                .try_into()
        })
        .transpose()
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH next_job AS (
                SELECT id, state AS prior_state
                FROM generation_jobs
                WHERE state = 'pending'
                   OR (state = 'retry_pending' AND (next_retry_at IS NULL OR next_retry_at <= $2))
                   OR (state IN ('claimed', 'processing') AND claimed_at < $3)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE generation_jobs AS j
            SET state = 'claimed',
                claim_owner = $1,
                claimed_at = $2,
                next_retry_at = NULL
            FROM next_job
            WHERE j.id = next_job.id
            RETURNING j.*, next_job.prior_state
            "#,
        )
        .bind(owner)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let prior_state: String = row
            .try_get("prior_state")
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        let job: Job = JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("claim_next", e))?
            .try_into()?;
        // The token carries the stored timestamp, which Postgres truncates to
        // microseconds.
        let token = job
            .token()
            .ok_or_else(|| StoreError::InvalidTransition(format!("job {} claimed without owner", job.id)))?;

        Ok(Some(ClaimedJob {
            job,
            token,
            reclaimed: prior_state == JobState::Claimed.as_str()
                || prior_state == JobState::Processing.as_str(),
        }))
    }

    #[instrument(skip(self, token), fields(job_id = %token.job_id, owner = %token.owner), err)]
    async fn start_processing(&self, token: &ClaimToken, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET state = 'processing', started_at = $4
            WHERE id = $1 AND claim_owner = $2 AND claimed_at = $3 AND state = 'claimed'
            RETURNING *
            "#,
        )
        .bind(Uuid::from(token.job_id))
        .bind(&token.owner)
        .bind(token.claimed_at)
        .bind(now);

        self.guarded_update("start_processing", query, token.job_id).await
    }

    #[instrument(skip(self, token, completion), fields(job_id = %token.job_id, owner = %token.owner), err)]
    async fn complete(
        &self,
        token: &ClaimToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET state = 'completed',
                result_reference = $4,
                external_request_id = $5,
                external_response_raw = $6,
                external_response_compressed = $7,
                tokens_used = $8,
                next_retry_at = NULL,
                completed_at = $9
            WHERE id = $1 AND claim_owner = $2 AND claimed_at = $3 AND state = 'processing'
            RETURNING *
            "#,
        )
        .bind(Uuid::from(token.job_id))
        .bind(&token.owner)
        .bind(token.claimed_at)
        .bind(completion.result_reference)
        .bind(completion.external_request_id)
        .bind(completion.external_response_raw)
        .bind(completion.external_response_compressed)
        .bind(completion.tokens_used)
        .bind(now);

        self.guarded_update("complete", query, token.job_id).await
    }

    #[instrument(skip(self, token, outcome), fields(job_id = %token.job_id, owner = %token.owner, terminal = outcome.is_terminal()), err)]
    async fn fail(
        &self,
        token: &ClaimToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let query = match outcome {
            FailureOutcome::Retry {
                retry_count,
                next_retry_at,
                error,
            } => {
                if next_retry_at <= now {
                    return Err(StoreError::InvalidTransition(format!(
                        "job {}: next_retry_at must be later than the failure time",
                        token.job_id
                    )));
                }
                sqlx::query(
                    r#"
                    UPDATE generation_jobs
                    SET state = 'retry_pending',
                        claim_owner = NULL,
                        claimed_at = NULL,
                        retry_count = $4,
                        next_retry_at = $5,
                        error_message = $6,
                        error_details = $7
                    WHERE id = $1 AND claim_owner = $2 AND claimed_at = $3
                      AND state IN ('claimed', 'processing')
                    RETURNING *
                    "#,
                )
                .bind(Uuid::from(token.job_id))
                .bind(&token.owner)
                .bind(token.claimed_at)
                .bind(to_db_count(retry_count))
                .bind(next_retry_at)
                .bind(error.message)
                .bind(error.details)
            }
            FailureOutcome::Terminal { retry_count, error } => sqlx::query(
                r#"
                UPDATE generation_jobs
                SET state = 'failed',
                    retry_count = $4,
                    next_retry_at = NULL,
                    error_message = $5,
                    error_details = $6,
                    failed_at = $7
                WHERE id = $1 AND claim_owner = $2 AND claimed_at = $3
                  AND state IN ('claimed', 'processing')
                RETURNING *
                "#,
            )
            .bind(Uuid::from(token.job_id))
            .bind(&token.owner)
            .bind(token.claimed_at)
            .bind(to_db_count(retry_count))
            .bind(error.message)
            .bind(error.details)
            .bind(now),
        };

        self.guarded_update("fail", query, token.job_id).await
    }

    #[instrument(skip(self), err)]
    async fn list_by_state(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM generation_jobs
            WHERE ($1::TEXT IS NULL OR state = $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(state.map(JobState::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter()
            .map(|row| -> Result<Job, StoreError> {
                JobRow::from_row(row)
                    .map_err(|e| map_sqlx_error("list_by_state", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM generation_jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(parse_state(&state)?, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn to_db_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn parse_state(raw: &str) -> Result<JobState, StoreError> {
    raw.parse()
        .map_err(|_| SchemaDrift::UnknownEnumValue(format!("generation_jobs.state = {raw:?}")).into())
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            let drift = match db_err.code().as_deref() {
                Some("42703") => Some(SchemaDrift::MissingColumn(msg.clone())),
                Some("42P01") => Some(SchemaDrift::MissingTable(msg.clone())),
                Some("42804") => Some(SchemaDrift::TypeMismatch(msg.clone())),
                Some("22P02") => Some(SchemaDrift::UnknownEnumValue(msg.clone())),
                Some(_) => None,
                None => SchemaDrift::from_message(&msg),
            };
            drift.map_or(StoreError::Database(msg), StoreError::SchemaMismatch)
        }
        sqlx::Error::ColumnNotFound(column) => {
            SchemaDrift::MissingColumn(format!("{column} (in {operation})")).into()
        }
        sqlx::Error::ColumnDecode { index, source } => {
            SchemaDrift::TypeMismatch(format!("column {index} in {operation}: {source}")).into()
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {}", operation))
        }
        other => {
            let msg = format!("sqlx error in {}: {}", operation, other);
            SchemaDrift::from_message(&msg).map_or(StoreError::Database(msg), StoreError::SchemaMismatch)
        }
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    subject_id: Uuid,
    academic_year: String,
    template_id: Uuid,
    state: String,
    priority: i32,
    claimed_at: Option<DateTime<Utc>>,
    claim_owner: Option<String>,
    input_payload: serde_json::Value,
    result_reference: Option<String>,
    external_request_id: Option<String>,
    external_response_raw: Option<String>,
    external_response_compressed: Option<Vec<u8>>,
    tokens_used: Option<i64>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    error_details: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    created_by: Option<Uuid>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            subject_id: row.try_get("subject_id")?,
            academic_year: row.try_get("academic_year")?,
            template_id: row.try_get("template_id")?,
            state: row.try_get("state")?,
            priority: row.try_get("priority")?,
            claimed_at: row.try_get("claimed_at")?,
            claim_owner: row.try_get("claim_owner")?,
            input_payload: row.try_get("input_payload")?,
            result_reference: row.try_get("result_reference")?,
            external_request_id: row.try_get("external_request_id")?,
            external_response_raw: row.try_get("external_response_raw")?,
            external_response_compressed: row.try_get("external_response_compressed")?,
            tokens_used: row.try_get("tokens_used")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
            error_details: row.try_get("error_details")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            created_by: row.try_get("created_by")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let academic_year = AcademicYear::parse(&row.academic_year).map_err(|e| {
            StoreError::Serialization(format!("job {}: academic_year: {e}", row.id))
        })?;

        let claim = match (row.claim_owner, row.claimed_at) {
            (Some(owner), Some(claimed_at)) => Some(Claim { owner, claimed_at }),
            (None, None) => None,
            _ => {
                return Err(StoreError::Serialization(format!(
                    "job {}: claim_owner and claimed_at must be set together",
                    row.id
                )));
            }
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            identity: IdentityKey::new(
                SubjectId::from_uuid(row.subject_id),
                academic_year,
                TemplateId::from_uuid(row.template_id),
            ),
            state: parse_state(&row.state)?,
            priority: row.priority,
            claim,
            input_payload: row.input_payload,
            result_reference: row.result_reference,
            external_request_id: row.external_request_id,
            external_response_raw: row.external_response_raw,
            external_response_compressed: row.external_response_compressed,
            tokens_used: row.tokens_used,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            error_details: row.error_details,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            created_by: row.created_by.map(UserId::from_uuid),
        })
    }
}
