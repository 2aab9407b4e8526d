//! Routing steps that choose follow-up steps at run time.
//!
//! A router never touches the pipeline: it returns the follow-up steps on
//! its result and the orchestrator splices them in directly after it. The
//! router's own result carries no value, so the follow-ups receive the
//! router's input.

use super::Step;
use crate::context::ExecutionContext;
use crate::core::{StepResult, StepValue};
use crate::errors::AgentflowError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Selector = Arc<dyn Fn(&StepValue, &ExecutionContext) -> Option<String> + Send + Sync>;
type RouteFn =
    Arc<dyn Fn(&StepValue, &ExecutionContext) -> anyhow::Result<Vec<Arc<dyn Step>>> + Send + Sync>;

/// Metadata key under which a router records the route it took.
#[must_use]
pub fn route_metadata_key(router: &str) -> String {
    format!("route.{router}")
}

/// Picks one of several named routes with a selector closure.
///
/// A selector returning `None`, or naming an unknown route, falls back to
/// the default route (which may be empty). The chosen route name is stored
/// in context metadata under `route.<router name>`.
#[derive(Clone)]
pub struct RouterStep {
    name: String,
    selector: Selector,
    routes: HashMap<String, Vec<Arc<dyn Step>>>,
    fallback: Vec<Arc<dyn Step>>,
}

impl RouterStep {
    /// Creates a router with no routes.
    pub fn new<F>(name: impl Into<String>, selector: F) -> Self
    where
        F: Fn(&StepValue, &ExecutionContext) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            selector: Arc::new(selector),
            routes: HashMap::new(),
            fallback: Vec::new(),
        }
    }

    /// Adds a named route.
    #[must_use]
    pub fn route(mut self, key: impl Into<String>, steps: Vec<Arc<dyn Step>>) -> Self {
        self.routes.insert(key.into(), steps);
        self
    }

    /// Sets the default route.
    #[must_use]
    pub fn fallback(mut self, steps: Vec<Arc<dyn Step>>) -> Self {
        self.fallback = steps;
        self
    }
}

impl fmt::Debug for RouterStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<&String> = self.routes.keys().collect();
        routes.sort();
        f.debug_struct("RouterStep")
            .field("name", &self.name)
            .field("routes", &routes)
            .field("fallback", &self.fallback.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for RouterStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        _attempt: u32,
        _previous: Option<&StepResult>,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let chosen = (self.selector)(input, ctx)
            .and_then(|key| self.routes.get_key_value(&key).map(|(k, steps)| (k.clone(), steps)));

        let (route, steps) = match chosen {
            Some((key, steps)) => (key, steps.clone()),
            None => ("default".to_string(), self.fallback.clone()),
        };
        debug!(router = %self.name, route = %route, steps = steps.len(), "Route selected");
        ctx.set_metadata(route_metadata_key(&self.name), serde_json::json!(route));

        Ok(StepResult::empty(&self.name).with_next_steps(steps))
    }
}

/// A router whose follow-up steps come straight from a closure.
#[derive(Clone)]
pub struct FnRouter {
    name: String,
    func: RouteFn,
}

impl FnRouter {
    /// Creates a closure router.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepValue, &ExecutionContext) -> anyhow::Result<Vec<Arc<dyn Step>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FnRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRouter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for FnRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StepValue,
        ctx: &ExecutionContext,
        _attempt: u32,
        _previous: Option<&StepResult>,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        let steps = (self.func)(input, ctx)?;
        Ok(StepResult::empty(&self.name).with_next_steps(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::NoOpStep;

    fn step(name: &str) -> Arc<dyn Step> {
        Arc::new(NoOpStep::new(name))
    }

    fn names(result: &StepResult) -> Vec<&str> {
        result.next_steps().iter().map(|s| s.name()).collect()
    }

    #[tokio::test]
    async fn test_router_picks_route_and_records_it() {
        let router = RouterStep::new("triage", |input, _| {
            input
                .as_text()
                .map(|t| (if t.contains('?') { "question" } else { "statement" }).to_string())
        })
        .route("question", vec![step("answer"), step("cite")])
        .route("statement", vec![step("ack")]);

        let ctx = ExecutionContext::new();
        let result = router
            .execute(&StepValue::from("why?"), &ctx, 1, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(names(&result), vec!["answer", "cite"]);
        assert!(result.value().is_none());
        assert_eq!(ctx.metadata("route.triage"), Some(serde_json::json!("question")));
    }

    #[tokio::test]
    async fn test_unknown_route_uses_fallback() {
        let router = RouterStep::new("triage", |_, _| Some("nope".into()))
            .route("question", vec![step("answer")])
            .fallback(vec![step("clarify")]);

        let ctx = ExecutionContext::new();
        let result = router
            .execute(&StepValue::Empty, &ctx, 1, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&result), vec!["clarify"]);
        assert_eq!(ctx.metadata("route.triage"), Some(serde_json::json!("default")));
    }

    #[tokio::test]
    async fn test_fn_router() {
        let router = FnRouter::new("fan", |_, _| Ok(vec![step("a"), step("b")]));
        let result = router
            .execute(&StepValue::Empty, &ExecutionContext::new(), 1, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&result), vec!["a", "b"]);
    }
}
