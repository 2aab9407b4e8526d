//! The remote generation service boundary.

use super::{GenerationRequest, GenerationResponse, LlmError, StreamChunk};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A lazy, finite, non-restartable sequence of chunks.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, LlmError>>;

/// A remote generation service.
///
/// Implementations build provider payloads; they report non-success
/// statuses through [`GenerationResponse::status`] (or as
/// [`LlmError::Status`] when opening a stream) so callers can read
/// rate-limit headers.
#[async_trait]
pub trait GenerationService: Send + Sync + fmt::Debug {
    /// Provider name used in logs and metric labels.
    fn name(&self) -> &str {
        "generation"
    }

    /// Runs one request to completion.
    async fn invoke(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, LlmError>;

    /// Opens a streamed response. The stream should stop when `cancel`
    /// fires.
    async fn invoke_streaming(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError>;
}

/// Drains a chunk stream into a single response.
///
/// The first error ends collection and is returned.
pub async fn collect_stream(mut stream: ChunkStream) -> Result<GenerationResponse, LlmError> {
    let mut response = GenerationResponse::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        response.content.push_str(&chunk.delta);
        response.tool_calls.extend(chunk.tool_calls);
        if let Some(usage) = chunk.usage {
            response.usage = usage;
        }
        if let Some(reason) = chunk.finish_reason {
            response.finish_reason = reason;
        }
    }
    Ok(response)
}
