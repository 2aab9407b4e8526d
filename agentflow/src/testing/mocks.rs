//! Scripted steps and generation services for tests.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue};
use crate::errors::{AgentflowError, ContractSide, ContractViolationError};
use crate::llm::{
    ChunkStream, FinishReason, GenerationRequest, GenerationResponse, GenerationService,
    LlmError, StreamChunk,
};
use crate::steps::{Step, StepConfig};

/// One scripted step outcome.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Return its input unchanged.
    PassThrough,
    /// Succeed with a value.
    Succeed(StepValue),
    /// Return an error result.
    Report(String),
    /// Raise a fault.
    Raise(String),
    /// Raise a contract violation.
    Violate,
    /// Sleep, then succeed with a value.
    Hang(Duration, StepValue),
}

/// A step that replays a script of outcomes, one per attempt.
///
/// Once the script runs out the last outcome repeats; an empty script
/// passes its input through. Every invocation is recorded.
#[derive(Debug)]
pub struct ScriptedStep {
    name: String,
    config: StepConfig,
    script: Mutex<VecDeque<StepOutcome>>,
    last: Mutex<StepOutcome>,
    attempts: Mutex<Vec<u32>>,
    inputs: Mutex<Vec<StepValue>>,
    previous_seen: Mutex<Vec<bool>>,
    started_at: Mutex<Vec<Instant>>,
}

impl ScriptedStep {
    /// Creates a pass-through step with the default configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: StepConfig::default(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(StepOutcome::PassThrough),
            attempts: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            previous_seen: Mutex::new(Vec::new()),
            started_at: Mutex::new(Vec::new()),
        }
    }

    /// Sets the step configuration.
    #[must_use]
    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    /// Queues an outcome.
    #[must_use]
    pub fn then(self, outcome: StepOutcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Queues a text success.
    #[must_use]
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(StepOutcome::Succeed(StepValue::Text(text.into())))
    }

    /// Queues an error result.
    #[must_use]
    pub fn then_report(self, message: impl Into<String>) -> Self {
        self.then(StepOutcome::Report(message.into()))
    }

    /// Queues a raised fault.
    #[must_use]
    pub fn then_raise(self, message: impl Into<String>) -> Self {
        self.then(StepOutcome::Raise(message.into()))
    }

    /// Attempt numbers seen, in call order.
    #[must_use]
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }

    /// Inputs seen, in call order.
    #[must_use]
    pub fn inputs(&self) -> Vec<StepValue> {
        self.inputs.lock().clone()
    }

    /// Whether each call received a previous-attempt result.
    #[must_use]
    pub fn previous_seen(&self) -> Vec<bool> {
        self.previous_seen.lock().clone()
    }

    /// When each call started.
    #[must_use]
    pub fn started_at(&self) -> Vec<Instant> {
        self.started_at.lock().clone()
    }

    /// Number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.attempts.lock().len()
    }

    fn next_outcome(&self) -> StepOutcome {
        let mut script = self.script.lock();
        match script.pop_front() {
            Some(outcome) => {
                *self.last.lock() = outcome.clone();
                outcome
            }
            None => self.last.lock().clone(),
        }
    }
}

#[async_trait]
impl Step for ScriptedStep {
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
        previous: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        self.attempts.lock().push(attempt);
        self.inputs.lock().push(input.clone());
        self.previous_seen.lock().push(previous.is_some());
        self.started_at.lock().push(Instant::now());

        match self.next_outcome() {
            StepOutcome::PassThrough => Ok(StepResult::success(&self.name, input.clone())),
            StepOutcome::Succeed(value) => Ok(StepResult::success(&self.name, value)),
            StepOutcome::Report(message) => Ok(StepResult::error_message(&self.name, message)),
            StepOutcome::Raise(message) => Err(AgentflowError::StepExecution(message)),
            StepOutcome::Violate => Err(ContractViolationError::new(
                &self.name,
                ContractSide::Input,
                "json",
                input.kind().to_string(),
            )
            .into()),
            StepOutcome::Hang(delay, value) => {
                tokio::select! {
                    () = cancel.cancelled() => {
                        Err(AgentflowError::Cancelled(format!("step '{}' cancelled", self.name)))
                    }
                    () = tokio::time::sleep(delay) => Ok(StepResult::success(&self.name, value)),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum ServiceOutcome {
    Respond(GenerationResponse),
    Fail(LlmError),
    Stream(Vec<StreamChunk>),
}

/// A generation service that replays scripted outcomes.
///
/// Once the script runs out the last outcome repeats. Responses requested
/// as streams are split into a delta and a finish chunk; scripted streams
/// requested whole are collected.
#[derive(Debug)]
pub struct MockGenerationService {
    script: Mutex<VecDeque<ServiceOutcome>>,
    last: Mutex<Option<ServiceOutcome>>,
    latency: Option<Duration>,
    calls: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl Default for MockGenerationService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerationService {
    /// Creates a service with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            latency: None,
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delays every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a response.
    #[must_use]
    pub fn then_respond(self, response: GenerationResponse) -> Self {
        self.script.lock().push_back(ServiceOutcome::Respond(response));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_fail(self, error: LlmError) -> Self {
        self.script.lock().push_back(ServiceOutcome::Fail(error));
        self
    }

    /// Queues a streamed response.
    #[must_use]
    pub fn then_stream(self, chunks: Vec<StreamChunk>) -> Self {
        self.script.lock().push_back(ServiceOutcome::Stream(chunks));
        self
    }

    /// When each call arrived.
    #[must_use]
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    /// Number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Requests received, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    async fn next_outcome(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ServiceOutcome, LlmError> {
        self.calls.lock().push(Instant::now());
        self.requests.lock().push(request.clone());

        if let Some(latency) = self.latency {
            tokio::select! {
                () = cancel.cancelled() => return Err(LlmError::Cancelled),
                () = tokio::time::sleep(latency) => {}
            }
        }

        let next = self.script.lock().pop_front();
        let outcome = match next {
            Some(outcome) => {
                *self.last.lock() = Some(outcome.clone());
                outcome
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or_else(|| ServiceOutcome::Respond(GenerationResponse::text(""))),
        };
        Ok(outcome)
    }
}

#[async_trait]
impl GenerationService for MockGenerationService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        match self.next_outcome(request, cancel).await? {
            ServiceOutcome::Respond(response) => Ok(response),
            ServiceOutcome::Fail(error) => Err(error),
            ServiceOutcome::Stream(chunks) => {
                crate::llm::collect_stream(stream::iter(chunks.into_iter().map(Ok)).boxed()).await
            }
        }
    }

    async fn invoke_streaming(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let chunks = match self.next_outcome(request, cancel).await? {
            ServiceOutcome::Fail(error) => return Err(error),
            ServiceOutcome::Respond(response) if !response.status.is_success() => {
                return Err(LlmError::Status(response.status));
            }
            ServiceOutcome::Respond(response) => {
                let mut delta = StreamChunk::delta(response.content);
                delta.tool_calls = response.tool_calls;
                let reason = if delta.tool_calls.is_empty() {
                    response.finish_reason
                } else {
                    FinishReason::ToolCalls
                };
                vec![delta, StreamChunk::finish(reason, response.usage)]
            }
            ServiceOutcome::Stream(chunks) => chunks,
        };
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepPayload;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_scripted_step_repeats_last_outcome() {
        let step = ScriptedStep::new("s").then_report("first").then_text("done");
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let input = StepValue::Text("in".into());

        let first = step.execute(&input, &ctx, 1, None, &cancel).await.unwrap();
        let second = step.execute(&input, &ctx, 2, Some(&first), &cancel).await.unwrap();
        let third = step.execute(&input, &ctx, 3, None, &cancel).await.unwrap();

        assert!(first.has_error());
        assert_eq!(second.value().and_then(StepValue::as_text), Some("done"));
        assert_eq!(third.value().and_then(StepValue::as_text), Some("done"));
        assert_eq!(step.attempts(), vec![1, 2, 3]);
        assert_eq!(step.previous_seen(), vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_empty_script_passes_input_through() {
        let step = ScriptedStep::new("echo");
        let result = step
            .execute(
                &"hello".to_string().into_value(),
                &ExecutionContext::new(),
                1,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.value().and_then(StepValue::as_text), Some("hello"));
    }

    #[tokio::test]
    async fn test_mock_service_streams_scripted_response() {
        let service = MockGenerationService::new().then_respond(GenerationResponse::text("hi"));
        let stream = service
            .invoke_streaming(&GenerationRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        let response = crate::llm::collect_stream(stream).await.unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(service.call_count(), 1);
    }
}
