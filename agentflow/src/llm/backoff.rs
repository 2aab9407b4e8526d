//! Wait-time computation between generation attempts.
//!
//! Provider signals win over the local schedule, in this order:
//! 1. `Retry-After: <seconds>`
//! 2. `X-RateLimit-Reset: <unix seconds>`; a reset time that already passed
//!    falls back to the initial delay
//! 3. exponential backoff, doubling per attempt, plus 0..`jitter_ratio`
//!    of added jitter, capped at `max_delay_ms`

use super::{LlmError, LlmRetryConfig};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Where a computed delay came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySource {
    /// The `Retry-After` header.
    RetryAfter,
    /// The `X-RateLimit-Reset` header.
    RateLimitReset,
    /// The local exponential schedule.
    Exponential,
}

impl fmt::Display for DelaySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryAfter => write!(f, "retry_after"),
            Self::RateLimitReset => write!(f, "rate_limit_reset"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

/// A computed wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    /// How long to wait.
    pub delay: Duration,
    /// What decided it.
    pub source: DelaySource,
}

/// Computes the wait after failed attempt number `attempt` (1-based).
#[must_use]
pub fn compute_delay(
    err: &LlmError,
    attempt: u32,
    now: DateTime<Utc>,
    config: &LlmRetryConfig,
) -> RetryDelay {
    let jitter = rand::thread_rng().gen_range(0.0..=config.jitter_ratio.max(0.0));
    compute_delay_with_jitter(err, attempt, now, config, jitter)
}

/// [`compute_delay`] with an explicit jitter fraction.
#[must_use]
pub fn compute_delay_with_jitter(
    err: &LlmError,
    attempt: u32,
    now: DateTime<Utc>,
    config: &LlmRetryConfig,
    jitter: f64,
) -> RetryDelay {
    if let Some(status) = err.status() {
        if let Some(delay) = status.retry_after() {
            return RetryDelay {
                delay,
                source: DelaySource::RetryAfter,
            };
        }
        if let Some(reset_at) = status.rate_limit_reset() {
            let remaining_ms = reset_at
                .saturating_mul(1000)
                .saturating_sub(now.timestamp_millis());
            let delay = u64::try_from(remaining_ms)
                .ok()
                .filter(|ms| *ms > 0)
                .map_or_else(|| config.initial_delay(), Duration::from_millis);
            return RetryDelay {
                delay,
                source: DelaySource::RateLimitReset,
            };
        }
    }

    RetryDelay {
        delay: exponential_delay(attempt, config, jitter),
        source: DelaySource::Exponential,
    }
}

/// `initial * 2^(attempt-1) * (1 + jitter)`, capped at the max delay.
#[must_use]
pub fn exponential_delay(attempt: u32, config: &LlmRetryConfig, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = config
        .initial_delay_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jittered = (base as f64 * (1.0 + jitter.max(0.0))) as u64;
    Duration::from_millis(jittered.min(config.max_delay_ms))
}
