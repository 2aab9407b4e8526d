//! Request, response and chunk types exchanged with a generation service.

use crate::context::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Header carrying a "retry after N seconds" signal.
pub const RETRY_AFTER: &str = "retry-after";

/// Header carrying the unix time (seconds) at which the rate limit resets.
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Conversation to send, in order.
    pub messages: Vec<Message>,
    /// Model identifier, provider default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Completion token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Tools offered to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl GenerationRequest {
    /// Creates a request for `messages`.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the completion token cap.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Adds a tool.
    #[must_use]
    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u32,
    /// Completion tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Creates a usage record.
    #[must_use]
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
    }
}

/// Normalized completion reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    #[default]
    Stop,
    /// Token cap reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// Output withheld by a content filter.
    ContentFilter,
    /// Anything the provider reports that has no mapping.
    Unknown,
}

impl FinishReason {
    /// Maps a provider-specific reason string.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" | "complete" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            "content_filter" | "safety" => Self::ContentFilter,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolCalls => write!(f, "tool_calls"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw provider status line and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// HTTP-style status code.
    pub status_code: u16,
    /// Response headers, names lowercased.
    #[serde(default, deserialize_with = "lowercase_headers")]
    pub headers: HashMap<String, String>,
}

impl Default for ProviderStatus {
    fn default() -> Self {
        Self::ok()
    }
}

impl ProviderStatus {
    /// A status with no headers.
    #[must_use]
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
        }
    }

    /// `200 OK`.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Adds a header. Names are stored lowercased, so a later casing of
    /// the same name replaces an earlier one.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.headers.insert(name, value.into());
        self
    }

    /// Returns true for 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Returns true for 408, 429 and every 5xx.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.status_code, 408 | 429) || (500..600).contains(&self.status_code)
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
    }

    /// The `Retry-After` delay, when given in seconds.
    ///
    /// Negative, non-finite or out-of-range values count as no signal.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let secs: f64 = self.header(RETRY_AFTER)?.parse().ok()?;
        Duration::try_from_secs_f64(secs).ok()
    }

    /// The `X-RateLimit-Reset` unix timestamp in seconds.
    #[must_use]
    pub fn rate_limit_reset(&self) -> Option<i64> {
        let raw = self.header(RATE_LIMIT_RESET)?;
        raw.parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
    }
}

fn lowercase_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect())
}

/// A complete generation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Generated text.
    pub content: String,
    /// Token counts.
    #[serde(default)]
    pub usage: TokenUsage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: FinishReason,
    /// Tool calls requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Raw provider status.
    #[serde(default)]
    pub status: ProviderStatus,
}

impl GenerationResponse {
    /// A successful text response.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// A response carrying only a provider status, e.g. a 429.
    #[must_use]
    pub fn from_status(status: ProviderStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Sets token usage.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Sets the finish reason.
    #[must_use]
    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    /// Adds a tool call.
    #[must_use]
    pub fn with_tool_call(mut self, call: ToolCallRequest) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// One element of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text produced since the previous chunk.
    pub delta: String,
    /// Cumulative usage, usually only on the last chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Set on the last chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Tool calls completed in this chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl StreamChunk {
    /// A text delta.
    #[must_use]
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Self::default()
        }
    }

    /// A final chunk with usage and reason.
    #[must_use]
    pub fn finish(reason: FinishReason, usage: TokenUsage) -> Self {
        Self {
            usage: Some(usage),
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}
