//! Circuit breaker for the direct (proxy-less) lane.
//!
//! When the registry has no eligible proxy the crawler may go out from its
//! own address. Repeated connection failures or challenge pages on that lane
//! open the circuit; while open, direct attempts fail fast and the page
//! stalls until a later pass instead of getting the origin blocked.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N transient failures]--> OPEN --[recovery timeout]--> HALF_OPEN
//!   ^                                  ^                              |
//!   |                                  +----------[failure]-----------+
//!   +-----------------------[M successes]-----------------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Direct attempts flow normally.
    Closed,
    /// Direct attempts are rejected immediately.
    Open,
    /// A limited number of probe attempts decide whether to close again.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures before opening.
    pub failure_threshold: u32,

    /// Successful half-open attempts needed to close.
    pub success_threshold: u32,

    /// Time spent open before probing again.
    pub recovery_timeout: Duration,

    /// Opening on a challenge page multiplies the recovery timeout by this.
    pub challenge_backoff_multiplier: f32,

    /// Upper bound for the extended recovery timeout.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            challenge_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(900),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    recovery_timeout: Duration,
}

impl BreakerState {
    fn closed(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_error: None,
            recovery_timeout: config.recovery_timeout,
        }
    }

    fn remaining_open(&self) -> Duration {
        self.opened_at
            .map(|t| self.recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.recovery_timeout)
    }
}

/// Snapshot for logging.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Rejected without running the operation.
    Open { name: String, retry_after: Duration },
    /// The operation ran and failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => write!(
                f,
                "Circuit breaker '{}' is open. Retry after {} seconds.",
                name,
                retry_after.as_secs()
            ),
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { retry_after, .. } => AppError::DirectLaneOpen {
                retry_after_secs: retry_after.as_secs(),
            },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Thread-safe circuit breaker; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerState::closed(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_inner(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
            time_until_half_open: (inner.state == CircuitState::Open)
                .then(|| inner.remaining_open()),
        }
    }

    /// Run `operation` unless the circuit is open, recording its outcome.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut inner = self.lock_inner();
            self.maybe_half_open(&mut inner);
            if inner.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: inner.remaining_open(),
                });
            }
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }
        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Direct lane recovered, closing circuit");
                    *inner = BreakerState::closed(&self.config);
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        inner.last_error = Some(error.to_string());

        let should_open = match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.failure_count >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !should_open {
            return;
        }

        if error.is_challenge() {
            let extended = Duration::from_secs_f32(
                inner.recovery_timeout.as_secs_f32() * self.config.challenge_backoff_multiplier,
            );
            inner.recovery_timeout = extended.min(self.config.max_recovery_timeout);
        }
        tracing::warn!(
            circuit = %self.name,
            failures = inner.failure_count,
            recovery_secs = inner.recovery_timeout.as_secs(),
            %error,
            "Opening circuit on direct lane"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.success_count = 0;
    }

    pub fn reset(&self) {
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *self.lock_inner() = BreakerState::closed(&self.config);
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit half-open, probing direct lane");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }
}
