//! Reusable exponential-backoff retry policy.

use crate::errors::AgentflowError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&AgentflowError) -> bool + Send + Sync>;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.85;
/// Upper bound (exclusive) of the jitter factor.
pub const JITTER_MAX: f64 = 1.15;

/// Immutable retry configuration, reusable across calls.
///
/// The delay before attempt `n` (n ≥ 2) is
/// `min(initial_delay × multiplier^(n-1), max_delay)`, scaled by a random
/// factor in `[0.85, 1.15)` when jitter is on.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Randomize delays.
    pub jitter: bool,
    #[serde(skip)]
    retry_on: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retry_on: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("custom_predicate", &self.retry_on.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the default transient-fault classification.
    #[must_use]
    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AgentflowError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Returns true if `err` should be retried.
    #[must_use]
    pub fn is_retryable(&self, err: &AgentflowError) -> bool {
        self.retry_on
            .as_ref()
            .map_or_else(|| err.is_transient(), |predicate| predicate(err))
    }

    /// Un-jittered delay before attempt `attempt` (1-based; zero for the
    /// first attempt).
    #[must_use]
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_secs_f64(capped / 1000.0)
    }

    /// Delay before `attempt`, jittered if enabled.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_before_attempt(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX))
        } else {
            delay
        }
    }

    /// Runs `action` until it succeeds, fails with a non-retryable error,
    /// or attempts run out.
    ///
    /// `action` receives the 1-based attempt number. Exhaustion yields
    /// [`AgentflowError::RetryExhausted`] wrapping the last failure; a
    /// non-retryable failure is returned as is. Cancelling `cancel` during
    /// a wait yields [`AgentflowError::Cancelled`].
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut action: F,
    ) -> Result<T, AgentflowError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AgentflowError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                debug!(attempt, error = %err, "Failure is not retryable");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "Retry attempts exhausted");
                return Err(AgentflowError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.jittered_delay(attempt + 1);
            warn!(
                attempt,
                max_attempts,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retrying after failure"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(AgentflowError::Cancelled("retry wait cancelled".into()));
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn fixed_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_initial_delay_ms(1000)
            .with_backoff_multiplier(2.0)
            .with_max_delay_ms(10_000)
            .with_jitter(false)
    }

    #[test]
    fn test_delay_schedule() {
        let policy = fixed_policy();
        let delays: Vec<_> = (2..=6).map(|a| policy.delay_before_attempt(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_jitter_range() {
        let policy = fixed_policy().with_jitter(true);
        for _ in 0..200 {
            let d = policy.jittered_delay(2);
            assert!(d >= Duration::from_millis(1700));
            assert!(d < Duration::from_millis(2300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_waits_exact_delays_then_exhausts() {
        let policy = fixed_policy().with_max_attempts(5);
        let stamps = Mutex::new(Vec::new());

        let err = policy
            .execute(&CancellationToken::new(), |_| {
                stamps.lock().push(Instant::now());
                async { Err::<(), _>(AgentflowError::Transport("reset".into())) }
            })
            .await
            .unwrap_err();

        let stamps = stamps.into_inner();
        let gaps: Vec<_> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
            ]
        );
        match err {
            AgentflowError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*source, AgentflowError::Transport(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let policy = fixed_policy();
        let mut calls = 0;
        let err = policy
            .execute(&CancellationToken::new(), |_| {
                calls += 1;
                async { Err::<(), _>(AgentflowError::Validation("bad".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AgentflowError::Validation(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let policy = fixed_policy();
        let value = policy
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(AgentflowError::timeout("call", Duration::from_secs(1)))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let policy = fixed_policy()
            .with_max_attempts(2)
            .with_retry_on(|e| matches!(e, AgentflowError::Validation(_)));
        let mut calls = 0;
        let err = policy
            .execute(&CancellationToken::new(), |_| {
                calls += 1;
                async { Err::<(), _>(AgentflowError::Validation("again".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AgentflowError::RetryExhausted { attempts: 2, .. }));
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let policy = fixed_policy().with_max_attempts(10);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let err = policy
            .execute(&cancel, |_| async {
                Err::<(), _>(AgentflowError::Transport("x".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentflowError::Cancelled(_)));
    }

    #[test]
    fn test_serde_skips_predicate() {
        let policy = RetryPolicy::new().with_retry_on(|_| true);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["max_attempts"], 3);
        assert!(json.get("retry_on").is_none());

        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back.max_delay_ms, 30_000);
    }
}
