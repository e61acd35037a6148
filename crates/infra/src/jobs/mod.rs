//! Generation jobs: model, persistence, retry policy and submission.
//!
//! ## Components
//!
//! - `types`: `Job` and its single `JobState` machine
//! - `store`: the `JobStore` trait and an in-memory store
//! - `postgres`: the durable store (claim by `FOR UPDATE SKIP LOCKED`)
//! - `retry`: backoff and terminal-failure decisions
//! - `service`: `submit` / `get_status`

pub mod postgres;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use retry::{FailureClass, RetryPolicy};
pub use service::{JobService, SubmitError, SubmitRequest};
pub use store::{InMemoryJobStore, JobStats, JobStore, SchemaDrift, StoreError};
pub use types::{
    Claim, ClaimToken, ClaimedJob, Completion, FailureOutcome, FailureRecord, Job, JobState, JobStatus,
    JobStatusView, NewJob, QueueStatus,
};
