//! Tagged step values and the typed payload conversions built on them.

use super::ParallelResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The kind tag of a [`StepValue`], used to declare step contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Accepts every kind.
    Any,
    /// No value.
    Empty,
    /// Plain text.
    Text,
    /// Arbitrary JSON.
    Json,
    /// An action with free-form metadata.
    Action,
    /// Aggregated branch results.
    Parallel,
}

impl Default for ValueKind {
    fn default() -> Self {
        Self::Any
    }
}

impl ValueKind {
    /// Returns true if a value of `actual` kind satisfies this declaration.
    #[must_use]
    pub fn accepts(self, actual: Self) -> bool {
        self == Self::Any || self == actual
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Empty => write!(f, "empty"),
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Action => write!(f, "action"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Payload of an action result: a message plus free-form metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    /// Human-readable message.
    pub message: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ActionPayload {
    /// Creates a new action payload.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The value carried by a step result and passed as the next step's input.
#[derive(Debug, Clone, Default)]
pub enum StepValue {
    /// No value.
    #[default]
    Empty,
    /// Plain text.
    Text(String),
    /// Arbitrary JSON.
    Json(serde_json::Value),
    /// An action with metadata.
    Action(ActionPayload),
    /// Aggregated branch results.
    Parallel(ParallelResult),
}

impl StepValue {
    /// Returns the kind tag.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Empty => ValueKind::Empty,
            Self::Text(_) => ValueKind::Text,
            Self::Json(_) => ValueKind::Json,
            Self::Action(_) => ValueKind::Action,
            Self::Parallel(_) => ValueKind::Parallel,
        }
    }

    /// Returns the text, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the JSON, if this is a JSON value.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the parallel result, if this is one.
    #[must_use]
    pub fn as_parallel(&self) -> Option<&ParallelResult> {
        match self {
            Self::Parallel(p) => Some(p),
            _ => None,
        }
    }

    /// Renders the value as JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Empty => serde_json::Value::Null,
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Json(v) => v.clone(),
            Self::Action(a) => serde_json::to_value(a).unwrap_or_default(),
            Self::Parallel(p) => p.to_json(),
        }
    }
}

impl From<String> for StepValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for StepValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<serde_json::Value> for StepValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// A Rust type that a typed step accepts or produces.
///
/// `from_value` is the single checked conversion point; returning `None`
/// means the value does not satisfy the contract.
pub trait StepPayload: Sized + Send + Sync + 'static {
    /// The declared kind.
    fn kind() -> ValueKind;

    /// Human-readable contract description used in violations.
    fn describe() -> String {
        Self::kind().to_string()
    }

    /// Converts from a step value, or `None` on mismatch.
    fn from_value(value: &StepValue) -> Option<Self>;

    /// Converts into a step value.
    fn into_value(self) -> StepValue;
}

impl StepPayload for StepValue {
    fn kind() -> ValueKind {
        ValueKind::Any
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        Some(value.clone())
    }

    fn into_value(self) -> StepValue {
        self
    }
}

impl StepPayload for () {
    fn kind() -> ValueKind {
        ValueKind::Empty
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        matches!(value, StepValue::Empty).then_some(())
    }

    fn into_value(self) -> StepValue {
        StepValue::Empty
    }
}

impl StepPayload for String {
    fn kind() -> ValueKind {
        ValueKind::Text
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        value.as_text().map(String::from)
    }

    fn into_value(self) -> StepValue {
        StepValue::Text(self)
    }
}

impl StepPayload for serde_json::Value {
    fn kind() -> ValueKind {
        ValueKind::Json
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        value.as_json().cloned()
    }

    fn into_value(self) -> StepValue {
        StepValue::Json(self)
    }
}

impl StepPayload for ActionPayload {
    fn kind() -> ValueKind {
        ValueKind::Action
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        match value {
            StepValue::Action(a) => Some(a.clone()),
            _ => None,
        }
    }

    fn into_value(self) -> StepValue {
        StepValue::Action(self)
    }
}

impl StepPayload for ParallelResult {
    fn kind() -> ValueKind {
        ValueKind::Parallel
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        value.as_parallel().cloned()
    }

    fn into_value(self) -> StepValue {
        StepValue::Parallel(self)
    }
}

/// Adapts any serde type into a JSON-kinded payload.
///
/// A JSON value that does not deserialize into `T` is a contract mismatch,
/// never a silent truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> StepPayload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn kind() -> ValueKind {
        ValueKind::Json
    }

    fn describe() -> String {
        format!("json<{}>", std::any::type_name::<T>())
    }

    fn from_value(value: &StepValue) -> Option<Self> {
        let json = value.as_json()?;
        serde_json::from_value(json.clone()).ok().map(Json)
    }

    fn into_value(self) -> StepValue {
        StepValue::Json(serde_json::to_value(self.0).unwrap_or_default())
    }
}
