//! Explicitly passed factory for run contexts.

use super::{Conversation, ExecutionContext, InMemoryConversation};
use crate::events::EventSink;
use crate::pipeline::Orchestrator;
use std::fmt;
use std::sync::Arc;

type ConversationFactory = Arc<dyn Fn() -> Box<dyn Conversation> + Send + Sync>;

/// Builds [`ExecutionContext`]s with a fixed event sink, orchestrator and
/// conversation template.
///
/// There is no process-wide default factory; hand one to whatever creates
/// runs.
#[derive(Clone)]
pub struct ContextFactory {
    event_sink: Option<Arc<dyn EventSink>>,
    orchestrator: Orchestrator,
    conversation: ConversationFactory,
}

impl Default for ContextFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextFactory {
    /// Creates a factory producing contexts with no sink, a default
    /// orchestrator and empty in-memory conversations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_sink: None,
            orchestrator: Orchestrator::default(),
            conversation: Arc::new(|| Box::new(InMemoryConversation::new())),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Sets the orchestrator.
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Sets how fresh conversations are built.
    #[must_use]
    pub fn with_conversation<F>(mut self, make: F) -> Self
    where
        F: Fn() -> Box<dyn Conversation> + Send + Sync + 'static,
    {
        self.conversation = Arc::new(make);
        self
    }

    /// The orchestrator handed to created contexts.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Creates a context with a generated correlation id.
    #[must_use]
    pub fn create(&self) -> ExecutionContext {
        let ctx = ExecutionContext::new()
            .with_conversation((self.conversation)())
            .with_orchestrator(self.orchestrator.clone());
        match &self.event_sink {
            Some(sink) => ctx.with_event_sink(Arc::clone(sink)),
            None => ctx,
        }
    }

    /// Creates a context for an existing correlation id, e.g. one
    /// conversation turn of a longer session.
    #[must_use]
    pub fn create_with_id(&self, correlation_id: impl Into<String>) -> ExecutionContext {
        self.create().with_correlation_id(correlation_id)
    }
}

impl fmt::Debug for ContextFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextFactory")
            .field("has_event_sink", &self.event_sink.is_some())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
