//! The run-scoped execution context and its branch clones.

use super::{Conversation, InMemoryConversation, Message, PathStack};
use crate::core::StepResult;
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::observability::MetricsSink;
use crate::pipeline::Orchestrator;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// State shared across one pipeline run.
///
/// Field sharing between a context and the branches derived from it via
/// [`ExecutionContext::branch`]:
///
/// | field          | branch gets                          |
/// |----------------|--------------------------------------|
/// | correlation id | same value                           |
/// | metadata       | same map (writes visible both ways)  |
/// | results        | same map (writes visible both ways)  |
/// | event sink     | same sink                            |
/// | orchestrator   | same driver                          |
/// | conversation   | deep copy, owned by the branch       |
/// | path stack     | copy of the current path, then independent |
pub struct ExecutionContext {
    correlation_id: String,
    conversation: Mutex<Box<dyn Conversation>>,
    metadata: Arc<DashMap<String, serde_json::Value>>,
    results: Arc<DashMap<String, StepResult>>,
    path: Mutex<PathStack>,
    event_sink: Option<Arc<dyn EventSink>>,
    orchestrator: Orchestrator,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Creates a context with a generated correlation id, an empty
    /// in-memory conversation, no event sink and a default orchestrator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            conversation: Mutex::new(Box::new(InMemoryConversation::new())),
            metadata: Arc::new(DashMap::new()),
            results: Arc::new(DashMap::new()),
            path: Mutex::new(PathStack::new()),
            event_sink: None,
            orchestrator: Orchestrator::default(),
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Sets the conversation handle.
    #[must_use]
    pub fn with_conversation(mut self, conversation: Box<dyn Conversation>) -> Self {
        self.conversation = Mutex::new(conversation);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Sets the orchestrator that drives steps run against this context.
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Derives a branch context for parallel execution.
    ///
    /// The conversation is deep-copied and the path stack copied; metadata,
    /// results, event sink and orchestrator are shared.
    #[must_use]
    pub fn branch(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            conversation: Mutex::new(self.conversation.lock().clone_box()),
            metadata: Arc::clone(&self.metadata),
            results: Arc::clone(&self.results),
            path: Mutex::new(self.path.lock().clone()),
            event_sink: self.event_sink.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }

    /// The run's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The orchestrator driving this context.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The metrics sink of the orchestrator.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        self.orchestrator.metrics()
    }

    // ---- path ----

    /// Enters a nested scope.
    pub fn push_path(&self, segment: impl Into<String>) {
        self.path.lock().push(segment);
    }

    /// Leaves the innermost scope. On an empty stack the path stays at root.
    pub fn pop_path(&self) -> Option<String> {
        self.path.lock().pop()
    }

    /// The current path, `""` at the root.
    #[must_use]
    pub fn current_path(&self) -> String {
        self.path.lock().current()
    }

    /// Nesting depth of the current path.
    #[must_use]
    pub fn path_depth(&self) -> usize {
        self.path.lock().depth()
    }

    // ---- results ----

    /// Records a result at `path`, replacing any earlier one.
    pub fn store_result(&self, path: impl Into<String>, result: StepResult) {
        self.results.insert(path.into(), result);
    }

    /// Records a result at the current path.
    pub fn store_result_here(&self, result: StepResult) {
        let path = self.current_path();
        self.store_result(path, result);
    }

    /// Looks up the result stored at `path`.
    #[must_use]
    pub fn result(&self, path: &str) -> Option<StepResult> {
        self.results.get(path).map(|r| r.value().clone())
    }

    /// Sorted paths of all stored results.
    #[must_use]
    pub fn result_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.results.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Copy of all stored results.
    #[must_use]
    pub fn results(&self) -> HashMap<String, StepResult> {
        self.results
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // ---- metadata ----

    /// Sets a metadata entry, returning the previous value.
    pub fn set_metadata(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.metadata.insert(key.into(), value)
    }

    /// Gets a metadata entry.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    /// Removes a metadata entry.
    pub fn remove_metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.remove(key).map(|(_, v)| v)
    }

    // ---- conversation ----

    /// Messages for the next generation request.
    #[must_use]
    pub fn messages_for_request(&self) -> Vec<Message> {
        self.conversation.lock().messages_for_request()
    }

    /// Appends a message to this context's conversation.
    pub fn push_message(&self, message: Message) {
        self.conversation.lock().push(message);
    }

    /// Runs `f` with mutable access to the conversation.
    pub fn with_conversation_mut<R>(&self, f: impl FnOnce(&mut dyn Conversation) -> R) -> R {
        let mut guard = self.conversation.lock();
        f(guard.as_mut())
    }

    /// Number of messages in this context's conversation.
    #[must_use]
    pub fn conversation_len(&self) -> usize {
        self.conversation.lock().len()
    }

    // ---- events ----

    /// Returns true if an event sink is attached.
    #[must_use]
    pub fn has_event_sink(&self) -> bool {
        self.event_sink.is_some()
    }

    /// Sends an event stamped with this run's correlation id and path.
    ///
    /// Never fails: a missing sink, a sink error, or a panic inside the
    /// sink all yield `false`.
    pub async fn send_event(&self, kind: EventKind, cancel: &CancellationToken) -> bool {
        let Some(sink) = self.event_sink.as_ref() else {
            return false;
        };

        let event = PipelineEvent::new(&self.correlation_id, self.current_path(), kind);
        match AssertUnwindSafe(sink.send(&event, cancel)).catch_unwind().await {
            Ok(Ok(delivered)) => delivered,
            Ok(Err(e)) => {
                warn!(
                    event_type = event.event_type(),
                    correlation_id = %self.correlation_id,
                    error = %e,
                    "Event sink failed; event dropped"
                );
                false
            }
            Err(_) => {
                warn!(
                    event_type = event.event_type(),
                    correlation_id = %self.correlation_id,
                    "Event sink panicked; event dropped"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.correlation_id)
            .field("path", &self.current_path())
            .field("results", &self.results.len())
            .field("metadata", &self.metadata.len())
            .field("has_event_sink", &self.event_sink.is_some())
            .finish()
    }
}
