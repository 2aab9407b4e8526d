//! Compile-time typed steps.
//!
//! A [`TypedStep`] names its input and output payload types. The [`Typed`]
//! adapter is the single point where a [`StepValue`] is converted to those
//! types; a mismatch is a contract violation, never a silent truncation.

use super::{Step, StepConfig};
use crate::context::ExecutionContext;
use crate::core::{StepPayload, StepResult, StepValue, ValueKind};
use crate::errors::{AgentflowError, ContractSide, ContractViolationError, StepError};
use async_trait::async_trait;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;

/// A step with declared payload types.
#[async_trait]
pub trait TypedStep: Send + Sync + Debug {
    /// Accepted input.
    type Input: StepPayload;
    /// Produced output.
    type Output: StepPayload;

    /// The step name.
    fn name(&self) -> &str;

    /// Retry and timeout configuration.
    fn config(&self) -> StepConfig {
        StepConfig::default()
    }

    /// Runs one attempt with converted payloads.
    ///
    /// `previous` is the typed value of the prior attempt's result, if it
    /// had one.
    async fn run(
        &self,
        input: Self::Input,
        ctx: &ExecutionContext,
        attempt: u32,
        previous: Option<Self::Output>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, StepError>;
}

/// Adapts a [`TypedStep`] to the untyped [`Step`] contract.
#[derive(Debug, Clone)]
pub struct Typed<S>(S);

impl<S: TypedStep> Typed<S> {
    /// Wraps a typed step.
    #[must_use]
    pub fn new(step: S) -> Self {
        Self(step)
    }

    /// The wrapped step.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.0
    }

    fn violation(&self, side: ContractSide, expected: String, actual: ValueKind) -> AgentflowError {
        ContractViolationError::new(self.0.name(), side, expected, actual.to_string()).into()
    }
}

#[async_trait]
impl<S: TypedStep> Step for Typed<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn config(&self) -> StepConfig {
        self.0.config()
    }

    fn input_kind(&self) -> ValueKind {
        S::Input::kind()
    }

    fn output_kind(&self) -> ValueKind {
        S::Output::kind()
    }

    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        attempt: u32,
        previous: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let typed_input = S::Input::from_value(input)
            .ok_or_else(|| self.violation(ContractSide::Input, S::Input::describe(), input.kind()))?;

        let typed_previous = match previous.and_then(StepResult::value) {
            None => None,
            Some(value) => Some(S::Output::from_value(value).ok_or_else(|| {
                self.violation(ContractSide::PreviousOutput, S::Output::describe(), value.kind())
            })?),
        };

        let name = self.0.name();
        Ok(
            match self.0.run(typed_input, ctx, attempt, typed_previous, cancel).await {
                Ok(output) => StepResult::success(name, output.into_value()),
                Err(err) => StepResult::failure(name, err),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Json;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug)]
    struct Shout;

    #[async_trait]
    impl TypedStep for Shout {
        type Input = String;
        type Output = String;

        fn name(&self) -> &str {
            "shout"
        }

        async fn run(
            &self,
            input: String,
            _ctx: &ExecutionContext,
            _attempt: u32,
            previous: Option<String>,
            _cancel: &CancellationToken,
        ) -> Result<String, StepError> {
            if input.is_empty() {
                return Err(StepError::new("nothing to shout"));
            }
            Ok(previous.map_or_else(|| input.to_uppercase(), |p| format!("{p}!")))
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Forecast {
        city: String,
        temp: i32,
    }

    #[derive(Debug)]
    struct Describe;

    #[async_trait]
    impl TypedStep for Describe {
        type Input = Json<Forecast>;
        type Output = String;

        fn name(&self) -> &str {
            "describe"
        }

        async fn run(
            &self,
            input: Json<Forecast>,
            _ctx: &ExecutionContext,
            _attempt: u32,
            _previous: Option<String>,
            _cancel: &CancellationToken,
        ) -> Result<String, StepError> {
            Ok(format!("{} is {}C", input.0.city, input.0.temp))
        }
    }

    async fn run(
        step: &dyn Step,
        input: StepValue,
        previous: Option<&StepResult>,
    ) -> Result<StepResult, AgentflowError> {
        step.execute(&input, &ExecutionContext::new(), 1, previous, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_typed_success() {
        let step = Typed::new(Shout);
        let result = run(&step, StepValue::from("hi"), None).await.unwrap();
        assert_eq!(result.value().and_then(StepValue::as_text), Some("HI"));
        assert_eq!(step.input_kind(), ValueKind::Text);
    }

    #[tokio::test]
    async fn test_typed_business_failure_is_a_result() {
        let result = run(&Typed::new(Shout), StepValue::from(""), None).await.unwrap();
        assert!(result.has_error());
    }

    #[tokio::test]
    async fn test_input_mismatch_is_contract_violation() {
        let err = run(&Typed::new(Shout), StepValue::Json(json!({"a": 1})), None)
            .await
            .unwrap_err();
        match err {
            AgentflowError::ContractViolation(v) => {
                assert_eq!(v.side, ContractSide::Input);
                assert_eq!(v.error_info.code, "CONTRACT-001-INPUT");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_previous_mismatch_is_contract_violation() {
        let previous = StepResult::success("shout", StepValue::Json(json!(1)));
        let err = run(&Typed::new(Shout), StepValue::from("hi"), Some(&previous))
            .await
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[tokio::test]
    async fn test_previous_value_is_passed_typed() {
        let previous = StepResult::success("shout", StepValue::from("HI"));
        let result = run(&Typed::new(Shout), StepValue::from("hi"), Some(&previous))
            .await
            .unwrap();
        assert_eq!(result.value().and_then(StepValue::as_text), Some("HI!"));
    }

    #[tokio::test]
    async fn test_json_payload_must_deserialize() {
        let ok = run(
            &Typed::new(Describe),
            StepValue::Json(json!({"city": "Oslo", "temp": 4})),
            None,
        )
        .await
        .unwrap();
        assert_eq!(ok.value().and_then(StepValue::as_text), Some("Oslo is 4C"));

        let err = run(&Typed::new(Describe), StepValue::Json(json!({"city": "Oslo"})), None)
            .await
            .unwrap_err();
        assert!(err.is_contract_violation());
    }
}
