//! The step driver: attempts, timeouts, validation, finalization and
//! routing splices.

use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue};
use crate::errors::{AgentflowError, StepError};
use crate::events::EventKind;
use crate::observability::{names, MetricsSink, NoOpMetrics};
use crate::steps::{SemanticValidator, Step, Validation};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pipeline-wide orchestration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-attempt timeout for steps that do not set one.
    pub default_step_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 60_000,
        }
    }
}

impl OrchestratorConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub fn with_default_step_timeout_ms(mut self, timeout: u64) -> Self {
        self.default_step_timeout_ms = timeout;
        self
    }

    /// The default per-attempt timeout.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

/// A step scheduled in a sequence, with its optional semantic validator.
#[derive(Clone)]
pub struct StepNode {
    /// The step.
    pub step: Arc<dyn Step>,
    /// Caller-supplied check run after structural validation.
    pub validator: Option<Arc<dyn SemanticValidator>>,
}

impl StepNode {
    /// Schedules a step without a semantic validator.
    #[must_use]
    pub fn new(step: Arc<dyn Step>) -> Self {
        Self {
            step,
            validator: None,
        }
    }

    /// Attaches a semantic validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn SemanticValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// The step name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.step.name()
    }
}

impl From<Arc<dyn Step>> for StepNode {
    fn from(step: Arc<dyn Step>) -> Self {
        Self::new(step)
    }
}

impl fmt::Debug for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepNode")
            .field("step", &self.step.name())
            .field("validator", &self.validator)
            .finish()
    }
}

/// Why an attempt did not produce an accepted result.
enum AttemptFailure {
    /// The step returned a result carrying an error.
    Reported(StepResult),
    /// Structural or semantic validation rejected the result.
    Rejected(StepResult, String),
    /// The attempt raised, timed out or was cancelled.
    Faulted(AgentflowError),
}

impl AttemptFailure {
    fn reason(&self) -> String {
        match self {
            Self::Reported(result) => result
                .error()
                .map_or_else(|| "step reported an error".to_string(), |e| e.message.clone()),
            Self::Rejected(_, message) => message.clone(),
            Self::Faulted(err) => err.to_string(),
        }
    }

    fn into_terminal(self, step: &str) -> StepResult {
        match self {
            Self::Reported(result) => result,
            Self::Rejected(mut result, message) => {
                result.set_error(StepError::validation(message));
                result
            }
            Self::Faulted(err) => StepResult::from_error(step, err),
        }
    }

    fn into_previous(self) -> Option<StepResult> {
        match self {
            Self::Reported(result) | Self::Rejected(result, _) => Some(result),
            Self::Faulted(_) => None,
        }
    }
}

/// Drives steps to terminal outcomes.
///
/// Cheap to clone; branches and nested pipelines share the same
/// orchestrator through the [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

impl Orchestrator {
    /// Creates an orchestrator that discards metrics.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Runs a sequence of steps.
    ///
    /// Each step receives the latest value produced so far (the sequence
    /// input until a step produces one). Follow-up steps returned on a
    /// result run next, in their returned order, before the remaining
    /// scheduled steps. The sequence stops at the first failed result,
    /// which becomes its outcome; otherwise the last result is.
    pub async fn run_sequence(
        &self,
        nodes: &[StepNode],
        input: StepValue,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let mut queue: VecDeque<StepNode> = nodes.iter().cloned().collect();
        let mut current = input;
        let mut last: Option<StepResult> = None;

        while let Some(node) = queue.pop_front() {
            let result = self.run_step(&node, &current, ctx, cancel).await?;
            if result.has_error() {
                return Ok(result);
            }

            for follow_up in result.next_steps().iter().rev() {
                queue.push_front(StepNode::new(Arc::clone(follow_up)));
            }
            if let Some(value) = result.value() {
                current = value.clone();
            }
            last = Some(result);
        }

        Ok(last.unwrap_or_else(|| StepResult::success("", current)))
    }

    /// Drives one step to its terminal result and records it at the step's
    /// path.
    ///
    /// Only contract violations are returned as `Err`; every other failure
    /// becomes an error result.
    pub async fn run_step(
        &self,
        node: &StepNode,
        input: &StepValue,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let name = node.step.name().to_string();
        let labels = [("step", name.as_str())];
        let started = Instant::now();

        ctx.push_path(name.as_str());
        let outcome = self.attempt_loop(node, &name, input, ctx, cancel).await;
        self.metrics
            .record_duration(names::STEP_DURATION, started.elapsed(), &labels);

        let (result, attempts) = match outcome {
            Ok(done) => done,
            Err(err) => {
                warn!(step = %name, error = %err, "Step raised a contract violation");
                self.metrics.increment(names::STEP_ERRORS, &labels);
                node.step.discard(ctx).await;
                ctx.pop_path();
                return Err(err);
            }
        };

        ctx.store_result_here(result.clone());
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Some(error) = result.error() {
            self.metrics.increment(names::STEP_ERRORS, &labels);
            warn!(step = %name, attempts, error = %error, "Step failed");
            node.step.discard(ctx).await;
            ctx.send_event(
                EventKind::StepFailed {
                    step: name.clone(),
                    attempts,
                    error: error.message.clone(),
                },
                cancel,
            )
            .await;
        } else {
            debug!(step = %name, attempts, duration_ms, "Step completed");
            ctx.send_event(
                EventKind::StepCompleted {
                    step: name.clone(),
                    attempts,
                    duration_ms,
                },
                cancel,
            )
            .await;
        }
        ctx.pop_path();

        Ok(result)
    }

    async fn attempt_loop(
        &self,
        node: &StepNode,
        name: &str,
        input: &StepValue,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<(StepResult, u32), AgentflowError> {
        let step = &node.step;
        let config = step.config();
        let max_attempts = config.max_retries.max(1);
        let timeout = config
            .timeout()
            .unwrap_or_else(|| self.config.default_step_timeout());
        let labels = [("step", name)];

        let mut previous: Option<StepResult> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.increment(names::STEP_EXECUTIONS, &labels);
            ctx.send_event(
                EventKind::StepStarted {
                    step: name.to_string(),
                    attempt,
                },
                cancel,
            )
            .await;
            debug!(step = %name, attempt, max_attempts, "Executing step");

            let attempt_token = cancel.child_token();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    Err(AgentflowError::Cancelled(format!("step '{name}' cancelled")))
                }
                r = step.execute(input, ctx, attempt, previous.as_ref(), &attempt_token) => r,
                () = tokio::time::sleep(timeout) => Err(AgentflowError::timeout(name, timeout)),
            };
            attempt_token.cancel();

            let failure = match outcome {
                Err(err) if err.is_contract_violation() => return Err(err),
                Err(err) => AttemptFailure::Faulted(err),
                Ok(result) if result.has_error() => AttemptFailure::Reported(result),
                Ok(result) => match self.validate(node, &result, ctx, cancel).await {
                    Validation::Valid => {
                        step.finalize(&result, ctx, cancel).await;
                        return Ok((result, attempt));
                    }
                    Validation::Invalid(message) => AttemptFailure::Rejected(result, message),
                },
            };

            if attempt >= max_attempts || cancel.is_cancelled() {
                return Ok((failure.into_terminal(name), attempt));
            }

            let delay = config.retry_delay();
            let reason = failure.reason();
            warn!(
                step = %name,
                attempt,
                max_attempts,
                delay_ms = config.retry_delay_ms,
                reason = %reason,
                "Retrying step"
            );
            self.metrics.increment(names::STEP_RETRIES, &labels);
            ctx.send_event(
                EventKind::StepRetrying {
                    step: name.to_string(),
                    attempt,
                    delay_ms: config.retry_delay_ms,
                    reason,
                },
                cancel,
            )
            .await;

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let err = AgentflowError::Cancelled(format!(
                        "step '{name}' cancelled while waiting to retry"
                    ));
                    return Ok((StepResult::from_error(name, err), attempt));
                }
                () = tokio::time::sleep(delay) => {}
            }
            previous = failure.into_previous();
        }
    }

    async fn validate(
        &self,
        node: &StepNode,
        result: &StepResult,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Validation {
        let structural = node.step.validate_structural(result, ctx, cancel).await;
        if !structural.is_valid() {
            return structural;
        }
        match &node.validator {
            Some(validator) => validator.validate(result, ctx, cancel).await,
            None => Validation::Valid,
        }
    }
}
