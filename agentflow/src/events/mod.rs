//! Event sink system for observability.
//!
//! Events are best-effort: a sink failure never becomes a pipeline failure.
//! There is no global sink; contexts carry theirs explicitly.

mod event;
mod sink;

pub use event::{EventKind, PipelineEvent};
pub use sink::{CollectingEventSink, EventSink, EventSinkError, LoggingEventSink, NoOpEventSink};
