//! Retrying wrapper around a [`GenerationService`].

use super::backoff::compute_delay;
use super::streaming::with_inactivity_timeout;
use super::{
    ChunkStream, GenerationRequest, GenerationResponse, GenerationService, LlmError, TokenUsage,
};
use crate::observability::{names, MetricsSink, NoOpMetrics};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry configuration for generation calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmRetryConfig {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// First exponential delay, and the floor for past rate-limit resets.
    pub initial_delay_ms: u64,
    /// Cap on exponential delays.
    pub max_delay_ms: u64,
    /// Upper bound of the jitter fraction added to exponential delays.
    pub jitter_ratio: f64,
    /// Streaming inactivity window.
    pub inactivity_timeout_ms: u64,
    /// Per-attempt budget for non-streaming calls.
    pub request_timeout_ms: Option<u64>,
}

impl Default for LlmRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.3,
            inactivity_timeout_ms: 30_000,
            request_timeout_ms: None,
        }
    }
}

impl LlmRetryConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Sets the streaming inactivity window.
    #[must_use]
    pub fn with_inactivity_timeout_ms(mut self, timeout: u64) -> Self {
        self.inactivity_timeout_ms = timeout;
        self
    }

    /// Sets the per-attempt budget for non-streaming calls.
    #[must_use]
    pub fn with_request_timeout_ms(mut self, timeout: u64) -> Self {
        self.request_timeout_ms = Some(timeout);
        self
    }

    /// The initial delay.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// The streaming inactivity window.
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// Calls a generation service with header-aware retries.
///
/// Retryable statuses (408, 429, 5xx) and network-level faults are retried
/// up to `max_attempts`; the last failure is returned. Streams are retried
/// only while opening; once chunks flow, the inactivity guard applies.
#[derive(Debug, Clone)]
pub struct ResilientGenerationClient {
    service: Arc<dyn GenerationService>,
    config: LlmRetryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl ResilientGenerationClient {
    /// Wraps `service` with the default config.
    #[must_use]
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self {
            service,
            config: LlmRetryConfig::default(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Sets the retry config.
    #[must_use]
    pub fn with_config(mut self, config: LlmRetryConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The retry config.
    #[must_use]
    pub fn config(&self) -> &LlmRetryConfig {
        &self.config
    }

    /// The wrapped service.
    #[must_use]
    pub fn service(&self) -> &Arc<dyn GenerationService> {
        &self.service
    }

    /// Runs `request` to completion, retrying transient failures.
    pub async fn invoke(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        let provider = self.service.name().to_string();
        let labels = [("provider", provider.as_str())];
        let started = Instant::now();

        let outcome = self
            .retrying(&labels, cancel, move || self.attempt_invoke(request, cancel))
            .await;

        self.metrics
            .record_duration(names::LLM_DURATION, started.elapsed(), &labels);
        if let Ok(response) = &outcome {
            self.metrics.record_tokens(&response.usage, &labels);
        }
        outcome
    }

    /// Opens a stream, retrying transient failures while opening.
    ///
    /// The returned stream ends with [`LlmError::StreamInactive`] if the
    /// provider stalls longer than the inactivity window. Call duration and
    /// the last reported token usage are recorded once the stream ends,
    /// fails or is dropped.
    pub async fn invoke_streaming(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let provider = self.service.name().to_string();
        let labels = [("provider", provider.as_str())];
        let window = self.config.inactivity_timeout();
        let started = Instant::now();

        let opened = self
            .retrying(&labels, cancel, move || async move {
                let token = cancel.child_token();
                let inner = self.service.invoke_streaming(request, &token).await?;
                Ok(with_inactivity_timeout(inner, window, token))
            })
            .await;

        match opened {
            Ok(guarded) => Ok(metered(
                guarded,
                StreamTelemetry {
                    metrics: Arc::clone(&self.metrics),
                    provider,
                    started,
                    usage: None,
                    recorded: false,
                },
            )),
            Err(err) => {
                self.metrics
                    .record_duration(names::LLM_DURATION, started.elapsed(), &labels);
                Err(err)
            }
        }
    }

    async fn attempt_invoke(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        let call = self.service.invoke(request, cancel);
        let response = match self.config.request_timeout_ms {
            Some(ms) => {
                let budget = Duration::from_millis(ms);
                tokio::time::timeout(budget, call)
                    .await
                    .map_err(|_| LlmError::Timeout(budget))??
            }
            None => call.await?,
        };

        if response.status.is_success() {
            Ok(response)
        } else {
            Err(LlmError::Status(response.status))
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        labels: &[(&str, &str)],
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            self.metrics.increment(names::LLM_CALLS, labels);

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(LlmError::Cancelled),
                r = attempt_fn() => r,
            };

            let err = match result {
                Ok(value) => {
                    debug!(attempt, "Generation call succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            self.metrics.increment(names::LLM_ERRORS, labels);
            if cancel.is_cancelled() || !err.is_retryable() || attempt >= max_attempts {
                warn!(attempt, max_attempts, error = %err, "Generation call failed");
                return Err(err);
            }

            let wait = compute_delay(&err, attempt, Utc::now(), &self.config);
            warn!(
                attempt,
                max_attempts,
                delay_ms = u64::try_from(wait.delay.as_millis()).unwrap_or(u64::MAX),
                source = %wait.source,
                status = err.status().map(|s| s.status_code),
                error = %err,
                "Retrying generation call"
            );
            self.metrics.increment(names::LLM_RETRIES, labels);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LlmError::Cancelled),
                () = tokio::time::sleep(wait.delay) => {}
            }
        }
    }
}

/// Records duration and token usage for one streamed call, exactly once.
struct StreamTelemetry {
    metrics: Arc<dyn MetricsSink>,
    provider: String,
    started: Instant,
    usage: Option<TokenUsage>,
    recorded: bool,
}

impl StreamTelemetry {
    fn record(&mut self) {
        if std::mem::replace(&mut self.recorded, true) {
            return;
        }
        let labels = [("provider", self.provider.as_str())];
        self.metrics
            .record_duration(names::LLM_DURATION, self.started.elapsed(), &labels);
        if let Some(usage) = &self.usage {
            self.metrics.record_tokens(usage, &labels);
        }
    }
}

impl Drop for StreamTelemetry {
    fn drop(&mut self) {
        self.record();
    }
}

/// Passes chunks through, keeping the latest usage report; usage is
/// cumulative, so only the last one counts.
fn metered(inner: ChunkStream, telemetry: StreamTelemetry) -> ChunkStream {
    stream::unfold((inner, telemetry), |(mut inner, mut telemetry)| async move {
        match inner.next().await {
            Some(Ok(chunk)) => {
                if let Some(usage) = chunk.usage {
                    telemetry.usage = Some(usage);
                }
                Some((Ok(chunk), (inner, telemetry)))
            }
            Some(Err(err)) => {
                telemetry.record();
                Some((Err(err), (inner, telemetry)))
            }
            None => {
                telemetry.record();
                None
            }
        }
    })
    .boxed()
}
