//! Resilience primitives usable by any caller: a circuit breaker and a
//! backoff retry policy.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryPolicy, RetryPredicate, JITTER_MAX, JITTER_MIN};
