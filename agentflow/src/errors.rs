//! Error types for the agentflow engine.
//!
//! Expected failures travel as error [`StepResult`](crate::core::StepResult)s
//! carrying a [`StepError`]. [`AgentflowError`] covers what is raised instead:
//! contract violations, faults escaping a step body, and the signals produced
//! by the resilience layer.

use crate::llm::LlmError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error type for agentflow operations.
#[derive(Debug, Error)]
pub enum AgentflowError {
    /// A typed step received an input or previous result of the wrong kind.
    #[error("{0}")]
    ContractViolation(#[from] ContractViolationError),

    /// Structural or semantic validation rejected a result.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        /// What timed out (step name, "llm.invoke", ...).
        operation: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// The caller's cancellation signal fired.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A network-level fault.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A failure reported by the remote generation service.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// A circuit breaker rejected the call without invoking the action.
    #[error("Circuit '{name}' is open; retry in {}ms", retry_in.as_millis())]
    CircuitOpen {
        /// The breaker name.
        name: String,
        /// Time left until the breaker admits a trial call.
        retry_in: Duration,
    },

    /// A retry policy ran out of attempts.
    #[error("Gave up after {attempts} attempt(s): {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying failure.
        source: Box<AgentflowError>,
    },

    /// A step body failed with an unexpected fault.
    #[error("Step execution error: {0}")]
    StepExecution(String),

    /// A pipeline was assembled incorrectly.
    #[error("{0}")]
    PipelineValidation(#[from] PipelineValidationError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentflowError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Default retry classification: transient network, timeout and
    /// provider-signaled faults.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Cancelled(_) | Self::Transport(_) => true,
            Self::Llm(e) => e.is_retryable(),
            Self::RetryExhausted { .. }
            | Self::ContractViolation(_)
            | Self::Validation(_)
            | Self::CircuitOpen { .. }
            | Self::StepExecution(_)
            | Self::PipelineValidation(_)
            | Self::Serialization(_)
            | Self::Internal(_) => false,
        }
    }

    /// Returns true for failures the orchestration loop must never retry.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }
}

impl From<anyhow::Error> for AgentflowError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(inner) => inner,
            Err(other) => Self::StepExecution(format!("{other:#}")),
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-001-INPUT").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Which side of a typed step's contract was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractSide {
    /// The input handed to the step.
    Input,
    /// The previous-attempt result handed back to the step.
    PreviousOutput,
    /// The value the step produced.
    Output,
}

impl fmt::Display for ContractSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::PreviousOutput => write!(f, "previous output"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Raised when a typed step is handed a value of the wrong kind.
#[derive(Debug, Clone, Error)]
#[error("Contract violation in step '{step}': {side} expected {expected}, got {actual}")]
pub struct ContractViolationError {
    /// The step whose contract was broken.
    pub step: String,
    /// Which side of the contract.
    pub side: ContractSide,
    /// The declared kind.
    pub expected: String,
    /// The kind actually received.
    pub actual: String,
    /// Diagnostics.
    pub error_info: ContractErrorInfo,
}

impl ContractViolationError {
    /// Creates a new contract violation.
    #[must_use]
    pub fn new(
        step: impl Into<String>,
        side: ContractSide,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        let step = step.into();
        let expected = expected.into();
        let actual = actual.into();
        let code = match side {
            ContractSide::Input => "CONTRACT-001-INPUT",
            ContractSide::PreviousOutput | ContractSide::Output => "CONTRACT-002-OUTPUT",
        };
        let error_info = ContractErrorInfo::new(
            code,
            format!("Step '{step}' declared {side} kind {expected} but saw {actual}"),
        )
        .with_fix_hint("Check that the preceding step produces the kind this step accepts.")
        .with_context_entry("step", step.clone());

        Self {
            step,
            side,
            expected,
            actual,
            error_info,
        }
    }
}

/// Error raised when a pipeline is assembled incorrectly.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }
}

/// Category of a [`StepError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The step reported a business-logic failure.
    Business,
    /// Structural or semantic validation rejected the result.
    Validation,
    /// An unexpected fault escaped the step body.
    Fault,
    /// The attempt exceeded its timeout.
    Timeout,
    /// The caller cancelled the run.
    Cancelled,
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Business => write!(f, "business"),
            Self::Validation => write!(f, "validation"),
            Self::Fault => write!(f, "fault"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The structured error attached to a failed step result.
#[derive(Clone, Serialize)]
pub struct StepError {
    /// Human-readable message.
    pub message: String,
    /// Category of failure.
    pub kind: StepErrorKind,
    /// The original failure, when one was raised.
    #[serde(skip)]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl StepError {
    /// Creates a business-logic error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Business,
            cause: None,
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Validation,
            cause: None,
        }
    }

    /// Wraps a raised failure, keeping it as the cause.
    #[must_use]
    pub fn from_error(err: AgentflowError) -> Self {
        let kind = match &err {
            AgentflowError::Timeout { .. } => StepErrorKind::Timeout,
            AgentflowError::Cancelled(_) => StepErrorKind::Cancelled,
            AgentflowError::Validation(_) => StepErrorKind::Validation,
            _ => StepErrorKind::Fault,
        };
        Self {
            message: err.to_string(),
            kind,
            cause: Some(Arc::new(err)),
        }
    }

    /// Sets the kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StepErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attaches an arbitrary cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}

impl fmt::Debug for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepError")
            .field("message", &self.message)
            .field("kind", &self.kind)
            .field("cause", &self.cause.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<AgentflowError> for StepError {
    fn from(err: AgentflowError) -> Self {
        Self::from_error(err)
    }
}
