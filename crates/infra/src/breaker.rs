//! Per-dependency circuit breakers.
//!
//! ## States
//!
//! - `Closed`: calls pass. Failures are timestamped; once `failure_threshold`
//!   of them fall inside `failure_window`, the breaker opens.
//! - `Open`: calls are rejected without being attempted until
//!   `recovery_timeout` has elapsed since the breaker opened.
//! - `HalfOpen`: exactly one trial call is let through. Success closes the
//!   breaker; failure reopens it and restarts the recovery timer.
//!
//! Every call is also bounded by `call_timeout`; a timeout counts as a failure.
//! Time is measured with `tokio::time::Instant`, so paused-time tests drive it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures inside the window that open the breaker.
    pub failure_threshold: u32,
    /// Length of the sliding failure window.
    pub failure_window: Duration,
    /// How long the breaker stays open before allowing a trial call.
    pub recovery_timeout: Duration,
    /// Upper bound on a single call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open for {dependency}")]
    Open { dependency: String },
    #[error("call to {dependency} timed out after {after:?}")]
    Timeout { dependency: String, after: Duration },
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`]. A trial
/// permit dropped without a report counts as a failure, so an abandoned trial
/// cannot leave the breaker half-open forever.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask for permission to make a call. `None` means short-circuit.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout);
                if !elapsed {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(dependency = %self.dependency, "circuit half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial && inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.opened_at = None;
            inner.trial_in_flight = false;
            info!(dependency = %self.dependency, "trial call succeeded, circuit closed");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!(dependency = %self.dependency, "trial call failed, circuit reopened");
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while let Some(&oldest) = inner.failures.front() {
                    if now.duration_since(oldest) > self.config.failure_window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }

                let recent = inner.failures.len();
                if recent >= self.config.failure_threshold as usize {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    warn!(
                        dependency = %self.dependency,
                        failures = recent,
                        window_secs = self.config.failure_window.as_secs(),
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            // Late results from calls admitted before the breaker opened.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    /// Run `call` through the breaker, bounded by the configured timeout.
    ///
    /// `counts_as_failure` decides whether an error from the dependency should
    /// count against it; errors caused by the request itself should not.
    pub async fn call<T, E, F>(
        &self,
        call: F,
        counts_as_failure: impl FnOnce(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or_else(|| BreakerError::Open {
            dependency: self.dependency.clone(),
        })?;

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if counts_as_failure(&err) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                permit.failure();
                Err(BreakerError::Timeout {
                    dependency: self.dependency.clone(),
                    after: self.config.call_timeout,
                })
            }
        }
    }
}

/// One breaker per named dependency.
#[derive(Debug)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Use `config` for `dependency` instead of the default.
    pub fn with_dependency(mut self, dependency: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    /// The breaker for `dependency`, created on first use.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(dependency)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(dependency, config))
            })
            .clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CircuitState> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}
