//! Step results: value, optional error, and follow-up steps.

use super::{ActionPayload, ParallelResult, StepValue};
use crate::errors::{AgentflowError, StepError};
use crate::steps::Step;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The outcome of one step invocation.
///
/// A result whose error is set is failed, even when a value is also present;
/// the value then carries partial or diagnostic content. Apart from the
/// error field, a result is immutable once built.
#[derive(Clone)]
pub struct StepResult {
    step: String,
    value: Option<StepValue>,
    error: Option<StepError>,
    next_steps: Vec<Arc<dyn Step>>,
}

impl StepResult {
    /// Creates a successful result carrying `value`.
    #[must_use]
    pub fn success(step: impl Into<String>, value: StepValue) -> Self {
        Self {
            step: step.into(),
            value: Some(value),
            error: None,
            next_steps: Vec::new(),
        }
    }

    /// Creates a successful result with no value.
    #[must_use]
    pub fn empty(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            value: None,
            error: None,
            next_steps: Vec::new(),
        }
    }

    /// Creates a success-with-message result.
    #[must_use]
    pub fn message(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::success(step, StepValue::Text(message.into()))
    }

    /// Creates an action result with metadata.
    #[must_use]
    pub fn action(
        step: impl Into<String>,
        message: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::success(
            step,
            StepValue::Action(ActionPayload {
                message: message.into(),
                metadata,
            }),
        )
    }

    /// Creates a parallel result aggregating branch results.
    #[must_use]
    pub fn parallel(step: impl Into<String>, branches: ParallelResult) -> Self {
        Self::success(step, StepValue::Parallel(branches))
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(step: impl Into<String>, error: StepError) -> Self {
        Self {
            step: step.into(),
            value: None,
            error: Some(error),
            next_steps: Vec::new(),
        }
    }

    /// Creates a failed result from an explicit message.
    #[must_use]
    pub fn error_message(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failure(step, StepError::new(message))
    }

    /// Creates a failed result wrapping a raised failure.
    #[must_use]
    pub fn from_error(step: impl Into<String>, err: AgentflowError) -> Self {
        Self::failure(step, StepError::from_error(err))
    }

    /// Attaches follow-up steps to run immediately after this one.
    #[must_use]
    pub fn with_next_steps(mut self, steps: Vec<Arc<dyn Step>>) -> Self {
        self.next_steps = steps;
        self
    }

    /// Attaches a value, e.g. diagnostic content on a failed result.
    #[must_use]
    pub fn with_value(mut self, value: StepValue) -> Self {
        self.value = Some(value);
        self
    }

    /// Sets the error after construction. Used by wrapping and finalizing
    /// operations; a later call replaces an earlier error.
    pub fn set_error(&mut self, error: StepError) {
        self.error = Some(error);
    }

    /// Name of the step that produced this result.
    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step
    }

    /// The value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&StepValue> {
        self.value.as_ref()
    }

    /// The error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    /// Returns true if the error is set.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns true if no error is set.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Follow-up steps returned by a routing step.
    #[must_use]
    pub fn next_steps(&self) -> &[Arc<dyn Step>] {
        &self.next_steps
    }

    /// Named fields of this result, used for template binding.
    ///
    /// Always contains `step`, `value`, `error` and `has_error`. JSON object
    /// values and action metadata are flattened one level, and parallel
    /// results expose each branch by name; flattened keys never shadow the
    /// fixed ones.
    #[must_use]
    pub fn to_fields(&self) -> HashMap<String, serde_json::Value> {
        let mut fields = HashMap::new();
        fields.insert("step".to_string(), serde_json::json!(self.step));
        fields.insert(
            "value".to_string(),
            self.value.as_ref().map_or(serde_json::Value::Null, StepValue::to_json),
        );
        fields.insert(
            "error".to_string(),
            self.error
                .as_ref()
                .map_or(serde_json::Value::Null, |e| serde_json::json!(e.message)),
        );
        fields.insert("has_error".to_string(), serde_json::json!(self.has_error()));

        let mut extra: Vec<(String, serde_json::Value)> = Vec::new();
        match &self.value {
            Some(StepValue::Json(serde_json::Value::Object(map))) => {
                extra.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(StepValue::Action(action)) => {
                extra.push(("message".to_string(), serde_json::json!(action.message)));
                extra.extend(action.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(StepValue::Parallel(parallel)) => {
                for name in parallel.names() {
                    if let Some(branch) = parallel.get(&name) {
                        let value = branch
                            .value()
                            .map_or(serde_json::Value::Null, StepValue::to_json);
                        extra.push((name, value));
                    }
                }
            }
            _ => {}
        }

        for (key, value) in extra {
            fields.entry(key).or_insert(value);
        }
        fields
    }

    /// Renders the result as JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "step": self.step,
            "value": self.value.as_ref().map_or(serde_json::Value::Null, StepValue::to_json),
            "error": self.error.as_ref().map(|e| serde_json::json!({
                "message": e.message,
                "kind": e.kind,
            })),
            "next_steps": self.next_steps.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepResult")
            .field("step", &self.step)
            .field("value", &self.value)
            .field("error", &self.error)
            .field(
                "next_steps",
                &self.next_steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
