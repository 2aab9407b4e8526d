//! Event sink trait and implementations.

use super::PipelineEvent;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Level};

/// Failure reported by an event sink.
#[derive(Debug, Clone, Error)]
#[error("Event sink error: {0}")]
pub struct EventSinkError(pub String);

/// Receives pipeline events.
///
/// Delivery is best-effort. Callers go through
/// [`ExecutionContext::send_event`](crate::context::ExecutionContext::send_event),
/// which turns any error or panic raised here into `false`.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event. `Ok(false)` means the sink declined it.
    async fn send(
        &self,
        event: &PipelineEvent,
        cancel: &CancellationToken,
    ) -> Result<bool, EventSinkError>;
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn send(
        &self,
        _event: &PipelineEvent,
        _cancel: &CancellationToken,
    ) -> Result<bool, EventSinkError> {
        Ok(true)
    }
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn send(
        &self,
        event: &PipelineEvent,
        _cancel: &CancellationToken,
    ) -> Result<bool, EventSinkError> {
        if self.level == Level::DEBUG {
            debug!(
                event_type = event.event_type(),
                correlation_id = %event.correlation_id,
                path = %event.path,
                event = ?event.kind,
                "Event: {}", event.event_type()
            );
        } else {
            info!(
                event_type = event.event_type(),
                correlation_id = %event.correlation_id,
                path = %event.path,
                event = ?event.kind,
                "Event: {}", event.event_type()
            );
        }
        Ok(true)
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events matching a type prefix, e.g. `"step."`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn send(
        &self,
        event: &PipelineEvent,
        _cancel: &CancellationToken,
    ) -> Result<bool, EventSinkError> {
        self.events.write().push(event.clone());
        Ok(true)
    }
}
