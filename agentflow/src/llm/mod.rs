//! LLM invocation with header-aware retries and streaming inactivity
//! timeouts.
//!
//! Concrete provider clients live outside this crate; they implement
//! [`GenerationService`] and report raw status and headers so that
//! [`ResilientGenerationClient`] can honour `Retry-After` and
//! `X-RateLimit-Reset`.

mod backoff;
mod client;
mod error;
mod service;
mod streaming;
mod types;

pub use backoff::{
    compute_delay, compute_delay_with_jitter, exponential_delay, DelaySource, RetryDelay,
};
pub use client::{LlmRetryConfig, ResilientGenerationClient};
pub use error::LlmError;
pub use service::{collect_stream, ChunkStream, GenerationService};
pub use streaming::with_inactivity_timeout;
pub use types::{
    FinishReason, GenerationRequest, GenerationResponse, ProviderStatus, StreamChunk,
    TokenUsage, ToolCallRequest, ToolDefinition, RATE_LIMIT_RESET, RETRY_AFTER,
};
