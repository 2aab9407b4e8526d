//! Step trait and implementations.
//!
//! Steps are the units of work in an agentflow pipeline. A step is an
//! immutable, stateless descriptor: everything run-specific arrives through
//! the input value, the [`ExecutionContext`] and the attempt number.

mod fn_step;
mod llm;
mod parallel;
mod router;
mod subpipeline;
mod typed;

pub use fn_step::FnStep;
pub use llm::LlmStep;
pub use parallel::{Branch, ParallelStep};
pub use router::{route_metadata_key, FnRouter, RouterStep};
pub use subpipeline::SubPipelineStep;
pub use typed::{Typed, TypedStep};

use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue, ValueKind};
use crate::errors::AgentflowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry and timeout configuration of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Attempts including the first; 1 means no retry.
    pub max_retries: u32,
    /// Wait between attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-attempt timeout in milliseconds; the orchestrator default
    /// applies when unset.
    pub timeout_ms: Option<u64>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_delay_ms: 100,
            timeout_ms: Some(60_000),
        }
    }
}

impl StepConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the wait between attempts.
    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }

    /// Defers to the orchestrator's default timeout.
    #[must_use]
    pub fn with_default_timeout(mut self) -> Self {
        self.timeout_ms = None;
        self
    }

    /// The wait between attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The per-attempt timeout, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Outcome of a validation check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Validation {
    /// The result is acceptable.
    #[default]
    Valid,
    /// The result was rejected.
    Invalid(String),
}

impl Validation {
    /// Creates a rejection.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Returns true if the result is acceptable.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// The rejection message.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Valid => None,
            Self::Invalid(message) => Some(message),
        }
    }
}

/// A unit of pipeline work.
///
/// Expected failures are returned as error [`StepResult`]s. Returning `Err`
/// is reserved for faults escaping the body and for contract violations,
/// which the orchestrator never retries.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// The step name, used as path segment and telemetry key.
    fn name(&self) -> &str;

    /// Retry and timeout configuration.
    fn config(&self) -> StepConfig {
        StepConfig::default()
    }

    /// The kind of input this step accepts.
    fn input_kind(&self) -> ValueKind {
        ValueKind::Any
    }

    /// The kind of value this step produces.
    fn output_kind(&self) -> ValueKind {
        ValueKind::Any
    }

    /// Runs one attempt.
    ///
    /// `attempt` starts at 1; `previous` is the result of the prior attempt
    /// when it produced one.
    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        attempt: u32,
        previous: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError>;

    /// Called once after a successful, validated result.
    async fn finalize(
        &self,
        _result: &StepResult,
        _ctx: &ExecutionContext,
        _cancel: &CancellationToken,
    ) {
    }

    /// Called once when the step ends without a finalized result, so that
    /// anything staged for `finalize` can be dropped.
    async fn discard(&self, _ctx: &ExecutionContext) {}

    /// Checks the shape of a successful result.
    async fn validate_structural(
        &self,
        _result: &StepResult,
        _ctx: &ExecutionContext,
        _cancel: &CancellationToken,
    ) -> Validation {
        Validation::Valid
    }
}

/// Caller-supplied check run after structural validation.
#[async_trait]
pub trait SemanticValidator: Send + Sync + Debug {
    /// Accepts or rejects a result.
    async fn validate(
        &self,
        result: &StepResult,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Validation;
}

/// A semantic validator backed by a closure.
pub struct FnValidator<F>
where
    F: Fn(&StepResult) -> Validation + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&StepResult) -> Validation + Send + Sync,
{
    /// Creates a named closure validator.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnValidator<F>
where
    F: Fn(&StepResult) -> Validation + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> SemanticValidator for FnValidator<F>
where
    F: Fn(&StepResult) -> Validation + Send + Sync,
{
    async fn validate(
        &self,
        result: &StepResult,
        _ctx: &ExecutionContext,
        _cancel: &CancellationToken,
    ) -> Validation {
        (self.func)(result)
    }
}

/// A step that passes its input through unchanged.
#[derive(Debug, Clone)]
pub struct NoOpStep {
    name: String,
}

impl NoOpStep {
    /// Creates a no-op step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Step for NoOpStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StepValue,
        _ctx: &ExecutionContext,
        _attempt: u32,
        _previous: Option<&StepResult>,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        Ok(StepResult::success(&self.name, input.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_config_defaults() {
        let config = StepConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.retry_delay(), Duration::from_millis(100));
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_step_config_serde_fills_defaults() {
        let config: StepConfig = serde_json::from_str(r#"{"max_retries": 3}"#).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 100);
        assert_eq!(config.timeout_ms, Some(60_000));

        let config = StepConfig::new().with_default_timeout();
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_validation() {
        assert!(Validation::Valid.is_valid());
        let invalid = Validation::invalid("missing field");
        assert!(!invalid.is_valid());
        assert_eq!(invalid.error(), Some("missing field"));
    }

    #[tokio::test]
    async fn test_noop_step_passes_input_through() {
        let step = NoOpStep::new("noop");
        let ctx = ExecutionContext::new();
        let result = step
            .execute(&StepValue::from("x"), &ctx, 1, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.value().and_then(StepValue::as_text), Some("x"));
        assert!(step.validate_structural(&result, &ctx, &CancellationToken::new()).await.is_valid());
    }

    #[tokio::test]
    async fn test_fn_validator() {
        let validator = FnValidator::new("non-empty", |r: &StepResult| {
            if r.value().is_some() {
                Validation::Valid
            } else {
                Validation::invalid("no value")
            }
        });
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        assert!(!validator.validate(&StepResult::empty("s"), &ctx, &cancel).await.is_valid());
    }
}
