//! Parallel fan-out over isolated branches.

use super::{SemanticValidator, Step, StepConfig};
use crate::context::ExecutionContext;
use crate::core::{ParallelResult, StepResult, StepValue, ValueKind};
use crate::errors::AgentflowError;
use crate::events::EventKind;
use crate::pipeline::StepNode;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A named step sequence run as one branch of a [`ParallelStep`].
#[derive(Debug, Clone)]
pub struct Branch {
    name: String,
    nodes: Vec<StepNode>,
}

impl Branch {
    /// Creates an empty branch.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// A branch made of a single step, named after it.
    #[must_use]
    pub fn single(step: Arc<dyn Step>) -> Self {
        Self {
            name: step.name().to_string(),
            nodes: vec![StepNode::new(step)],
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.nodes.push(StepNode::new(step));
        self
    }

    /// Appends a step checked by a semantic validator.
    #[must_use]
    pub fn step_with_validator(
        mut self,
        step: Arc<dyn Step>,
        validator: Arc<dyn SemanticValidator>,
    ) -> Self {
        self.nodes.push(StepNode::new(step).with_validator(validator));
        self
    }

    /// The branch name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs every branch concurrently and aggregates their terminal results.
///
/// Each branch runs on its own task against a branch context: it sees a
/// private copy of the conversation and path, and shares metadata and
/// stored results with its siblings. A failing branch never short-circuits
/// the others. The step's value is a [`ParallelResult`] keyed by branch
/// name, produced once every branch has finished.
#[derive(Debug, Clone)]
pub struct ParallelStep {
    name: String,
    branches: Vec<Branch>,
    config: StepConfig,
}

impl ParallelStep {
    /// Creates a parallel step with no branches.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            config: StepConfig::default().with_default_timeout(),
        }
    }

    /// Adds a branch.
    #[must_use]
    pub fn branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Sets the step configuration.
    #[must_use]
    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    /// Configured branch names.
    #[must_use]
    pub fn branch_names(&self) -> Vec<&str> {
        self.branches.iter().map(Branch::name).collect()
    }
}

#[async_trait]
impl Step for ParallelStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> StepConfig {
        self.config.clone()
    }

    fn output_kind(&self) -> ValueKind {
        ValueKind::Parallel
    }

    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        _attempt: u32,
        _previous: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let aggregate = ParallelResult::new();
        let mut in_flight = FuturesUnordered::new();

        for branch in &self.branches {
            let branch_ctx = ctx.branch();
            branch_ctx.push_path(branch.name.as_str());
            branch_ctx
                .send_event(
                    EventKind::BranchStarted {
                        branch: branch.name.clone(),
                    },
                    cancel,
                )
                .await;

            let nodes = branch.nodes.clone();
            let input = input.clone();
            let token = cancel.child_token();
            let name = branch.name.clone();
            let branch_name = name.clone();
            let handle = tokio::spawn(async move {
                let outcome = branch_ctx
                    .orchestrator()
                    .run_sequence(&nodes, input, &branch_ctx, &token)
                    .await;
                if let Ok(result) = &outcome {
                    branch_ctx
                        .send_event(
                            EventKind::BranchCompleted {
                                branch: branch_name,
                                success: result.is_success(),
                            },
                            &token,
                        )
                        .await;
                }
                outcome
            });
            in_flight.push(async move { (name, handle.await) });
        }

        let mut violation: Option<AgentflowError> = None;
        while let Some((name, joined)) = in_flight.next().await {
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    error!(step = %self.name, branch = %name, error = %err, "Branch raised");
                    let result = StepResult::error_message(&name, err.to_string());
                    violation.get_or_insert(err);
                    result
                }
                Err(join_err) => {
                    error!(
                        step = %self.name,
                        branch = %name,
                        error = %join_err,
                        "Branch task failed"
                    );
                    let err = AgentflowError::Internal(format!(
                        "branch '{name}' task failed: {join_err}"
                    ));
                    StepResult::from_error(&name, err)
                }
            };
            debug!(
                step = %self.name,
                branch = %name,
                success = result.is_success(),
                "Branch finished"
            );
            aggregate.register(name, result);
        }

        if let Some(err) = violation {
            return Err(err);
        }
        Ok(StepResult::parallel(&self.name, aggregate))
    }
}
