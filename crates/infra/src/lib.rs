//! Infrastructure layer: job store, claim protocol, workers and resilience.

pub mod artifacts;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod guard;
pub mod jobs;
pub mod worker;

pub use artifacts::{ArtifactError, ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, ConfigError};
pub use guard::{DegradationGuard, GuardedJobStore};
pub use worker::{PoolStats, ProcessOutcome, Worker, WorkerConfig, WorkerPool, WorkerPoolHandle};
