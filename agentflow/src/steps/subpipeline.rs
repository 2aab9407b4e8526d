//! Nesting a whole pipeline as one step.

use super::{Step, StepConfig};
use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue};
use crate::errors::AgentflowError;
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs a nested pipeline against the same context.
///
/// Inner results are stored under this step's path, e.g. `outer/inner`.
/// The inner outcome is relabelled with this step's name.
#[derive(Debug, Clone)]
pub struct SubPipelineStep {
    name: String,
    pipeline: Arc<Pipeline>,
    config: StepConfig,
}

impl SubPipelineStep {
    /// Wraps `pipeline` as a step called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            name: name.into(),
            pipeline: Arc::new(pipeline),
            config: StepConfig::default().with_default_timeout(),
        }
    }

    /// Sets the step configuration.
    #[must_use]
    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    /// The nested pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

#[async_trait]
impl Step for SubPipelineStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> StepConfig {
        self.config.clone()
    }

    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        _attempt: u32,
        _previous: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let inner = self.pipeline.run(input.clone(), ctx, cancel).await?;

        let mut result = match inner.value() {
            Some(value) => StepResult::success(&self.name, value.clone()),
            None => StepResult::empty(&self.name),
        };
        if let Some(error) = inner.error() {
            result.set_error(error.clone());
        }
        Ok(result)
    }
}
