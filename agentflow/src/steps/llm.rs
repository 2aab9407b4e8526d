//! A step that asks a generation service for the next assistant turn.

use super::{Step, StepConfig};
use crate::context::{ExecutionContext, Message};
use crate::core::{bind_fields, bind_template, ActionPayload, StepResult, StepValue, ValueKind};
use crate::errors::AgentflowError;
use crate::llm::{
    collect_stream, GenerationRequest, GenerationResponse, LlmError, ResilientGenerationClient,
};
use crate::resilience::CircuitBreaker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Metadata key holding the prompt of an exchange awaiting finalization.
fn pending_prompt_key(path: &str) -> String {
    format!("llm.pending_prompt.{path}")
}

/// Calls a [`ResilientGenerationClient`] with the context's conversation
/// plus one user turn.
///
/// The user turn is the bound prompt template when one is set, otherwise
/// the step input rendered as text. Templates may reference stored results
/// (`{path.field}`) and fields of a JSON input (`{field}`, with `{input}`
/// for the whole input). The exchange is appended to the conversation only
/// once the result has passed validation.
///
/// The value is the reply text, or an action carrying the requested tool
/// calls under `tool_calls`.
#[derive(Debug, Clone)]
pub struct LlmStep {
    name: String,
    client: ResilientGenerationClient,
    request: GenerationRequest,
    prompt: Option<String>,
    streaming: bool,
    breaker: Option<Arc<CircuitBreaker>>,
    config: StepConfig,
}

impl LlmStep {
    /// Creates an LLM step. The client's own retries apply, so the step
    /// itself defaults to a single attempt.
    #[must_use]
    pub fn new(name: impl Into<String>, client: ResilientGenerationClient) -> Self {
        Self {
            name: name.into(),
            client,
            request: GenerationRequest::default(),
            prompt: None,
            streaming: false,
            breaker: None,
            config: StepConfig::default().with_max_retries(1),
        }
    }

    /// Sets the request template (model, sampling, tools). Its messages
    /// are ignored.
    #[must_use]
    pub fn with_request(mut self, request: GenerationRequest) -> Self {
        self.request = request;
        self
    }

    /// Sets the prompt template.
    #[must_use]
    pub fn with_prompt(mut self, template: impl Into<String>) -> Self {
        self.prompt = Some(template.into());
        self
    }

    /// Consumes the reply as a stream guarded by the inactivity timeout.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Routes calls through a circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sets the step configuration.
    #[must_use]
    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    fn user_turn(&self, input: &StepValue, ctx: &ExecutionContext) -> Option<String> {
        let rendered_input = match input {
            StepValue::Empty => None,
            StepValue::Text(text) => Some(text.clone()),
            other => Some(other.to_json().to_string()),
        };

        let Some(template) = &self.prompt else {
            return rendered_input;
        };

        let mut fields: HashMap<String, serde_json::Value> = match input.as_json() {
            Some(serde_json::Value::Object(map)) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            _ => HashMap::new(),
        };
        if let Some(text) = rendered_input {
            fields.insert("input".to_string(), serde_json::Value::String(text));
        }
        Some(bind_fields(&bind_template(template, ctx), &fields))
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        if self.streaming {
            let stream = self.client.invoke_streaming(request, cancel).await?;
            collect_stream(stream).await
        } else {
            self.client.invoke(request, cancel).await
        }
    }
}

#[async_trait]
impl Step for LlmStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> StepConfig {
        self.config.clone()
    }

    fn output_kind(&self) -> ValueKind {
        ValueKind::Any
    }

    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        attempt: u32,
        _previous: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let prompt = self.user_turn(input, ctx);
        let mut messages = ctx.messages_for_request();
        if let Some(prompt) = &prompt {
            messages.push(Message::user(prompt.clone()));
        }
        let request = GenerationRequest {
            messages,
            ..self.request.clone()
        };

        debug!(
            step = %self.name,
            attempt,
            messages = request.messages.len(),
            "Requesting generation"
        );
        let response = match &self.breaker {
            Some(breaker) => {
                let request = &request;
                breaker
                    .call(move || async move {
                        self.generate(request, cancel).await.map_err(AgentflowError::from)
                    })
                    .await?
            }
            None => self.generate(&request, cancel).await?,
        };

        let key = pending_prompt_key(&ctx.current_path());
        match prompt {
            Some(prompt) => ctx.set_metadata(key, serde_json::Value::String(prompt)),
            None => ctx.remove_metadata(&key),
        };

        if response.tool_calls.is_empty() {
            return Ok(StepResult::message(&self.name, response.content));
        }
        let payload = ActionPayload::new(response.content)
            .with_metadata("tool_calls", serde_json::to_value(&response.tool_calls)?)
            .with_metadata("finish_reason", serde_json::to_value(response.finish_reason)?);
        Ok(StepResult::success(&self.name, StepValue::Action(payload)))
    }

    async fn finalize(
        &self,
        result: &StepResult,
        ctx: &ExecutionContext,
        _cancel: &CancellationToken,
    ) {
        if let Some(serde_json::Value::String(prompt)) =
            ctx.remove_metadata(&pending_prompt_key(&ctx.current_path()))
        {
            ctx.push_message(Message::user(prompt));
        }

        let reply = match result.value() {
            Some(StepValue::Text(text)) => text.clone(),
            Some(StepValue::Action(action)) => action.message.clone(),
            _ => return,
        };
        ctx.push_message(Message::assistant(reply));
    }

    async fn discard(&self, ctx: &ExecutionContext) {
        ctx.remove_metadata(&pending_prompt_key(&ctx.current_path()));
    }
}
