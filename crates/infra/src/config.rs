//! Configuration loading and representation.
//!
//! [`AppConfig`] is built once at startup, validated, and then passed down by
//! reference. Nothing reads the environment after that.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COURSEGEN_DATABASE_URL` | required |
//! | `COURSEGEN_GENERATION_API_KEY` | required |
//! | `COURSEGEN_GENERATION_BASE_URL` | `http://localhost:8090` |
//! | `COURSEGEN_WORKER_COUNT` | `4` |
//! | `COURSEGEN_POLL_INTERVAL_MS` | `1000` |
//! | `COURSEGEN_CLAIM_TTL_SECS` | `900` |
//! | `COURSEGEN_MAX_RETRIES` | `3` |
//! | `COURSEGEN_BACKOFF_BASE_MS` | `1000` |
//! | `COURSEGEN_BACKOFF_MULTIPLIER` | `2.0` |
//! | `COURSEGEN_BACKOFF_MAX_MS` | `900000` |
//! | `COURSEGEN_BREAKER_FAILURE_THRESHOLD` | `5` |
//! | `COURSEGEN_BREAKER_WINDOW_SECS` | `60` |
//! | `COURSEGEN_BREAKER_RECOVERY_SECS` | `30` |
//! | `COURSEGEN_GENERATION_TIMEOUT_SECS` | `120` |
//! | `COURSEGEN_DB_MAX_CONNECTIONS` | `10` |
//! | `COURSEGEN_ARTIFACT_DIR` | `./artifacts` |
//! | `COURSEGEN_COMPRESS_THRESHOLD_BYTES` | `16384` |
//! | `COURSEGEN_HTTP_ADDR` | `0.0.0.0:8080` |
//! | `COURSEGEN_LOG_FORMAT` | `json` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use coursegen_observability::LogFormat;

use crate::breaker::BreakerConfig;
use crate::jobs::retry::RetryPolicy;
use crate::worker::WorkerConfig;

const PREFIX: &str = "COURSEGEN_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: format!("{PREFIX}{key}"),
            message: message.into(),
        }
    }
}

/// Connection settings for the generation service.
#[derive(Clone, PartialEq, Eq)]
pub struct GenerationSettings {
    pub base_url: String,
    pub api_key: String,
    pub call_timeout: Duration,
}

impl std::fmt::Debug for GenerationSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub generation: GenerationSettings,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub artifact_dir: PathBuf,
    pub http_addr: SocketAddr,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (keys include the `COURSEGEN_` prefix).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let call_timeout = Duration::from_secs(env.parse("GENERATION_TIMEOUT_SECS", 120u64)?);

        let config = Self {
            database_url: env.required("DATABASE_URL")?,
            db_max_connections: env.parse("DB_MAX_CONNECTIONS", 10u32)?,
            generation: GenerationSettings {
                base_url: env
                    .optional("GENERATION_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:8090".to_string()),
                api_key: env.required("GENERATION_API_KEY")?,
                call_timeout,
            },
            worker: WorkerConfig {
                worker_count: env.parse("WORKER_COUNT", 4usize)?,
                poll_interval: Duration::from_millis(env.parse("POLL_INTERVAL_MS", 1_000u64)?),
                claim_ttl: Duration::from_secs(env.parse("CLAIM_TTL_SECS", 900u64)?),
                compress_threshold_bytes: env.parse("COMPRESS_THRESHOLD_BYTES", 16 * 1024usize)?,
                ..WorkerConfig::default()
            },
            retry: RetryPolicy {
                max_retries: env.parse("MAX_RETRIES", 3u32)?,
                base_backoff: Duration::from_millis(env.parse("BACKOFF_BASE_MS", 1_000u64)?),
                multiplier: env.parse("BACKOFF_MULTIPLIER", 2.0f64)?,
                max_backoff: Some(Duration::from_millis(env.parse("BACKOFF_MAX_MS", 900_000u64)?)),
            },
            breaker: BreakerConfig {
                failure_threshold: env.parse("BREAKER_FAILURE_THRESHOLD", 5u32)?,
                failure_window: Duration::from_secs(env.parse("BREAKER_WINDOW_SECS", 60u64)?),
                recovery_timeout: Duration::from_secs(env.parse("BREAKER_RECOVERY_SECS", 30u64)?),
                call_timeout,
            },
            artifact_dir: PathBuf::from(
                env.optional("ARTIFACT_DIR")
                    .unwrap_or_else(|| "./artifacts".to_string()),
            ),
            http_addr: env.parse("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            log_format: env.parse("LOG_FORMAT", LogFormat::Json)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.api_key.trim().is_empty() {
            return Err(ConfigError::Missing(format!("{PREFIX}GENERATION_API_KEY")));
        }
        if self.worker.worker_count == 0 {
            return Err(ConfigError::invalid("WORKER_COUNT", "at least one worker is required"));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(ConfigError::invalid("POLL_INTERVAL_MS", "must be positive"));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::invalid("DB_MAX_CONNECTIONS", "must be positive"));
        }
        self.retry
            .validate()
            .map_err(|e| ConfigError::invalid("BACKOFF_*", e.to_string()))?;
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("BREAKER_FAILURE_THRESHOLD", "must be at least 1"));
        }
        if self.breaker.failure_window.is_zero() {
            return Err(ConfigError::invalid("BREAKER_WINDOW_SECS", "must be positive"));
        }
        if self.breaker.call_timeout.is_zero() {
            return Err(ConfigError::invalid("GENERATION_TIMEOUT_SECS", "must be positive"));
        }
        // A claim must outlive the longest call, or healthy jobs get reclaimed.
        if self.worker.claim_ttl <= self.breaker.call_timeout {
            return Err(ConfigError::invalid(
                "CLAIM_TTL_SECS",
                "must be longer than GENERATION_TIMEOUT_SECS",
            ));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{key}")).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(format!("{PREFIX}{key}")))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}"))),
        }
    }
}
