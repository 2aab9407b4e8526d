//! Closure-backed steps.

use super::{Step, StepConfig};
use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue};
use crate::errors::AgentflowError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type StepFn = Arc<dyn Fn(StepValue, u32) -> BoxFuture<'static, anyhow::Result<StepValue>> + Send + Sync>;

/// A step whose body is an async closure.
///
/// An `Err` from the closure is a raised fault: the orchestrator retries it
/// and, once attempts run out, records an error result wrapping it.
#[derive(Clone)]
pub struct FnStep {
    name: String,
    config: StepConfig,
    func: StepFn,
}

impl FnStep {
    /// Creates a step from an async closure over the input.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StepValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepValue>> + Send + 'static,
    {
        Self::with_attempt(name, move |input, _attempt| func(input))
    }

    /// Creates a step from an async closure that also sees the attempt
    /// number.
    pub fn with_attempt<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StepValue, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepValue>> + Send + 'static,
    {
        Self {
            name: name.into(),
            config: StepConfig::default(),
            func: Arc::new(move |input, attempt| func(input, attempt).boxed()),
        }
    }

    /// Creates a step from a synchronous closure.
    pub fn sync<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StepValue) -> anyhow::Result<StepValue> + Send + Sync + 'static,
    {
        Self::with_attempt(name, move |input, _attempt| std::future::ready(func(input)))
    }

    /// Sets the retry and timeout configuration.
    #[must_use]
    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> StepConfig {
        self.config.clone()
    }

    async fn execute(
        &self,
        input: &StepValue,
        _ctx: &ExecutionContext,
        attempt: u32,
        _previous: Option<&StepResult>,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let value = (self.func)(input.clone(), attempt).await?;
        Ok(StepResult::success(&self.name, value))
    }
}
