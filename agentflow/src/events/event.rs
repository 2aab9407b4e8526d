//! Pipeline lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A pipeline run began.
    PipelineStarted {
        /// Pipeline name.
        pipeline: String,
    },
    /// A pipeline run reached its outcome.
    PipelineCompleted {
        /// Pipeline name.
        pipeline: String,
        /// Whether the outcome was a success.
        success: bool,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
    /// A step attempt began.
    StepStarted {
        /// Step name.
        step: String,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// A step attempt failed and another is scheduled.
    StepRetrying {
        /// Step name.
        step: String,
        /// The attempt that failed.
        attempt: u32,
        /// Wait before the next attempt.
        delay_ms: u64,
        /// Why the attempt failed.
        reason: String,
    },
    /// A step succeeded, validated and finalized.
    StepCompleted {
        /// Step name.
        step: String,
        /// Attempts used.
        attempts: u32,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
    /// A step exhausted its attempts.
    StepFailed {
        /// Step name.
        step: String,
        /// Attempts used.
        attempts: u32,
        /// Terminal error message.
        error: String,
    },
    /// A parallel branch began.
    BranchStarted {
        /// Branch name.
        branch: String,
    },
    /// A parallel branch reached its terminal result.
    BranchCompleted {
        /// Branch name.
        branch: String,
        /// Whether the branch result is a success.
        success: bool,
    },
}

impl EventKind {
    /// Dotted event type, e.g. `"step.retrying"`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline.started",
            Self::PipelineCompleted { .. } => "pipeline.completed",
            Self::StepStarted { .. } => "step.started",
            Self::StepRetrying { .. } => "step.retrying",
            Self::StepCompleted { .. } => "step.completed",
            Self::StepFailed { .. } => "step.failed",
            Self::BranchStarted { .. } => "branch.started",
            Self::BranchCompleted { .. } => "branch.completed",
        }
    }
}

/// An event stamped with the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Correlation id of the run.
    pub correlation_id: String,
    /// Context path at emission time.
    pub path: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PipelineEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(correlation_id: impl Into<String>, path: impl Into<String>, kind: EventKind) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            path: path.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Dotted event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}
