//! Retry eligibility and backoff scheduling.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use coursegen_core::DomainError;

use super::types::{FailureOutcome, FailureRecord};

/// Upper bound on any single backoff, regardless of configuration.
const BACKOFF_CEILING: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network, timeout, 5xx, open breaker: worth another attempt.
    Transient,
    /// Malformed input or a definitive rejection: retrying cannot help.
    NonRecoverable,
}

/// Retry policy: exponential backoff with an optional cap.
///
/// The delay before retry `n + 1` is `base_backoff × multiplier^n`, where `n`
/// is the number of retries already scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_backoff,
            multiplier,
            max_backoff: None,
        }
    }

    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.base_backoff.is_zero() {
            return Err(DomainError::validation("base backoff must be positive"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DomainError::validation(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if let Some(cap) = self.max_backoff {
            if cap < self.base_backoff {
                return Err(DomainError::validation(
                    "max backoff must not be shorter than the base backoff",
                ));
            }
        }
        Ok(())
    }

    /// Delay before the next attempt, given how many retries already happened.
    pub fn delay_for_attempt(&self, prior_retries: u32) -> Duration {
        let exponent = i32::try_from(prior_retries).unwrap_or(i32::MAX);
        let secs = self.base_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self
            .max_backoff
            .map_or(BACKOFF_CEILING, |cap| cap.min(BACKOFF_CEILING));

        Duration::try_from_secs_f64(secs)
            .unwrap_or(BACKOFF_CEILING)
            .min(cap)
    }

    /// Decide what happens to a job that just failed at `now`.
    pub fn decide(
        &self,
        retry_count: u32,
        class: FailureClass,
        error: FailureRecord,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        if class == FailureClass::NonRecoverable || retry_count >= self.max_retries {
            return FailureOutcome::Terminal { retry_count, error };
        }

        let delay = TimeDelta::from_std(self.delay_for_attempt(retry_count))
            .unwrap_or_else(|_| TimeDelta::days(30))
            .max(TimeDelta::milliseconds(1));

        FailureOutcome::Retry {
            retry_count: retry_count + 1,
            next_retry_at: now + delay,
            error,
        }
    }
}
