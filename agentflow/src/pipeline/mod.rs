//! Pipeline building and execution.
//!
//! A [`Pipeline`] is a named, ordered list of steps. Running it hands the
//! steps to the context's [`Orchestrator`], which drives each one through
//! attempts, timeouts, validation and routing splices.

mod builder;
mod orchestrator;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use orchestrator::{Orchestrator, OrchestratorConfig, StepNode};

use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue};
use crate::errors::AgentflowError;
use crate::events::EventKind;
use crate::observability::names;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A validated sequence of steps.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    nodes: Vec<StepNode>,
}

impl Pipeline {
    pub(crate) fn new(name: String, nodes: Vec<StepNode>) -> Self {
        Self { name, nodes }
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduled steps.
    #[must_use]
    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    /// Names of the scheduled steps, in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.nodes.iter().map(StepNode::name).collect()
    }

    /// Runs the pipeline against `ctx`.
    ///
    /// The outcome is the terminal result of the last step run, or of the
    /// first step that failed.
    ///
    /// # Errors
    ///
    /// Returns a contract violation raised by any step, including steps
    /// nested in parallel groups or sub-pipelines.
    pub async fn run(
        &self,
        input: StepValue,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let labels = [("pipeline", self.name.as_str())];
        let metrics = ctx.metrics();
        let started = Instant::now();

        metrics.increment(names::PIPELINE_EXECUTIONS, &labels);
        info!(
            pipeline = %self.name,
            correlation_id = %ctx.correlation_id(),
            steps = self.nodes.len(),
            "Pipeline started"
        );
        ctx.send_event(
            EventKind::PipelineStarted {
                pipeline: self.name.clone(),
            },
            cancel,
        )
        .await;

        let outcome = ctx
            .orchestrator()
            .run_sequence(&self.nodes, input, ctx, cancel)
            .await;

        let elapsed = started.elapsed();
        metrics.record_duration(names::PIPELINE_DURATION, elapsed, &labels);
        let success = matches!(&outcome, Ok(result) if result.is_success());
        if !success {
            metrics.increment(names::PIPELINE_ERRORS, &labels);
        }

        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Ok(result) if success => {
                info!(pipeline = %self.name, duration_ms, step = %result.step_name(), "Pipeline completed");
            }
            Ok(result) => {
                warn!(
                    pipeline = %self.name,
                    duration_ms,
                    step = %result.step_name(),
                    error = %result.error().map_or_else(String::new, ToString::to_string),
                    "Pipeline failed"
                );
            }
            Err(err) => {
                warn!(pipeline = %self.name, duration_ms, error = %err, "Pipeline aborted");
            }
        }
        ctx.send_event(
            EventKind::PipelineCompleted {
                pipeline: self.name.clone(),
                success,
                duration_ms,
            },
            cancel,
        )
        .await;

        outcome
    }
}
