//! A ready-wired context for pipeline tests.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::core::StepResult;
use crate::errors::StepErrorKind;
use crate::events::{CollectingEventSink, PipelineEvent};
use crate::observability::InMemoryMetrics;
use crate::pipeline::{Orchestrator, OrchestratorConfig};

/// An execution context wired to a collecting event sink and in-memory
/// metrics, plus a cancellation token for the run.
#[derive(Debug)]
pub struct TestHarness {
    /// The context to run against.
    pub ctx: ExecutionContext,
    /// Every event the run emitted.
    pub events: Arc<CollectingEventSink>,
    /// Every metric the run recorded.
    pub metrics: Arc<InMemoryMetrics>,
    /// Top-level cancellation.
    pub cancel: CancellationToken,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with the default orchestrator settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    /// Creates a harness with custom orchestrator settings.
    #[must_use]
    pub fn with_config(config: OrchestratorConfig) -> Self {
        let events = Arc::new(CollectingEventSink::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let orchestrator = Orchestrator::new(config).with_metrics(metrics.clone());
        let ctx = ExecutionContext::new()
            .with_correlation_id("test-run")
            .with_event_sink(events.clone())
            .with_orchestrator(orchestrator);

        Self {
            ctx,
            events,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// Event types in emission order, e.g. `"step.started"`.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .events()
            .iter()
            .map(PipelineEvent::event_type)
            .collect()
    }
}

/// Asserts that a result succeeded.
#[track_caller]
pub fn assert_succeeded(result: &StepResult) {
    assert!(
        result.is_success(),
        "Expected '{}' to succeed, got error: {:?}",
        result.step_name(),
        result.error()
    );
}

/// Asserts that a result failed with the given error kind.
#[track_caller]
pub fn assert_failed_with(result: &StepResult, kind: StepErrorKind) {
    match result.error() {
        Some(error) => assert_eq!(
            error.kind, kind,
            "Expected '{}' to fail with {kind}, got {}: {}",
            result.step_name(),
            error.kind,
            error.message
        ),
        None => panic!("Expected '{}' to fail with {kind}, but it succeeded", result.step_name()),
    }
}

/// Asserts that a result carries the given text.
#[track_caller]
pub fn assert_text(result: &StepResult, expected: &str) {
    assert_eq!(
        result.value().and_then(|v| v.as_text()),
        Some(expected),
        "Unexpected value on '{}'",
        result.step_name()
    );
}
