//! Circuit breaker for failure containment.
//!
//! Transitions:
//! - Closed → Open once consecutive failures reach the threshold
//! - Open → HalfOpen when a call arrives after the open duration
//! - HalfOpen → Closed when the single trial call succeeds
//! - HalfOpen → Open when the trial fails; the open timestamp is refreshed
//!   and the failure counter is kept

use crate::errors::AgentflowError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected without invoking the action.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial.
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the open duration.
    #[must_use]
    pub fn with_open_duration_ms(mut self, duration: u64) -> Self {
        self.open_duration_ms = duration;
        self
    }

    /// The open duration.
    #[must_use]
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Guards one protected resource.
///
/// Every read-modify-write of the counters happens under a single lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission for one call; releases an unfinished trial when dropped.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            inner.trial_in_flight = false;
            debug!(breaker = %self.breaker.name, "Trial call abandoned");
        }
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    /// The breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Reading never transitions; an expired Open circuit
    /// reports Open until a call arrives.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Closes the circuit and clears the counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(breaker = %self.name, old_state = %inner.state, "Circuit breaker reset");
        *inner = BreakerState::default();
    }

    /// Runs `action` unless the circuit is open.
    ///
    /// Returns [`AgentflowError::CircuitOpen`] without invoking `action`
    /// when rejected. Any error returned by `action` counts as a failure.
    pub async fn call<T, F, Fut>(&self, action: F) -> Result<T, AgentflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AgentflowError>>,
    {
        let permit = self.acquire()?;
        let result = action().await;
        permit.settle(result.is_ok());
        result
    }

    fn acquire(&self) -> Result<Permit<'_>, AgentflowError> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let open_for = self.config.open_duration();
                let elapsed = inner.opened_at.map_or(open_for, |at| at.elapsed());
                if elapsed < open_for {
                    return Err(self.rejected(open_for - elapsed));
                }
                info!(breaker = %self.name, "Circuit breaker half-open; admitting trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.rejected(Duration::ZERO));
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn rejected(&self, retry_in: Duration) -> AgentflowError {
        debug!(breaker = %self.name, retry_in_ms = ?retry_in.as_millis(), "Call rejected by open circuit");
        AgentflowError::CircuitOpen {
            name: self.name.clone(),
            retry_in,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen if trial => {
                info!(breaker = %self.name, "Circuit breaker closing after successful trial");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(breaker = %self.name, state = %inner.state, "Late success ignored");
            }
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "Circuit breaker opening due to failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    "Circuit breaker re-opening after half-open failure"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}
