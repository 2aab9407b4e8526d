//! End-to-end runs of pipelines through the orchestrator.

use super::*;
use crate::context::Message;
use crate::core::{ParallelResult, StepPayload};
use crate::errors::{ContractSide, StepErrorKind};
use crate::events::{EventKind, PipelineEvent};
use crate::observability::names;
use crate::steps::{
    Branch, FnStep, FnValidator, ParallelStep, RouterStep, Step, StepConfig, SubPipelineStep,
    Validation,
};
use crate::testing::{
    assert_failed_with, assert_succeeded, assert_text, ScriptedStep, StepOutcome, TestHarness,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn retrying(max_retries: u32) -> StepConfig {
    StepConfig::default().with_max_retries(max_retries)
}

fn text(s: &str) -> StepValue {
    s.to_string().into_value()
}

/// A step that appends its name to a shared log and emits it as text.
fn logged(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> FnStep {
    let log = Arc::clone(log);
    FnStep::sync(name, move |_input| {
        log.lock().push(name.to_string());
        Ok(text(name))
    })
}

/// A branch step that writes to the conversation and to shared metadata.
#[derive(Debug)]
struct Remember {
    name: String,
    delay: Duration,
}

#[async_trait]
impl Step for Remember {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _input: &StepValue,
        ctx: &ExecutionContext,
        _attempt: u32,
        _previous: Option<&StepResult>,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, AgentflowError> {
        tokio::time::sleep(self.delay).await;
        ctx.push_message(Message::assistant(format!("from {}", self.name)));
        ctx.set_metadata(format!("seen.{}", self.name), serde_json::json!(ctx.conversation_len()));
        Ok(StepResult::message(&self.name, ctx.current_path()))
    }
}

fn remember(name: &str, delay_ms: u64) -> Arc<dyn Step> {
    Arc::new(Remember {
        name: name.to_string(),
        delay: Duration::from_millis(delay_ms),
    })
}

fn step_events(events: &[PipelineEvent], step: &str) -> Vec<EventKind> {
    events
        .iter()
        .map(|e| e.kind.clone())
        .filter(|k| match k {
            EventKind::StepStarted { step: s, .. }
            | EventKind::StepRetrying { step: s, .. }
            | EventKind::StepCompleted { step: s, .. }
            | EventKind::StepFailed { step: s, .. } => s == step,
            _ => false,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_attempts_are_monotonic_and_see_previous_result() {
    let h = TestHarness::new();
    let step = Arc::new(
        ScriptedStep::new("flaky")
            .with_config(retrying(3))
            .then_report("first")
            .then_report("second")
            .then_text("third"),
    );

    let node = StepNode::new(step.clone());
    let result = h
        .ctx
        .orchestrator()
        .run_step(&node, &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_text(&result, "third");
    assert_eq!(step.attempts(), vec![1, 2, 3]);
    assert_eq!(step.previous_seen(), vec![false, true, true]);
    assert_eq!(h.metrics.counter(names::STEP_EXECUTIONS), 3);
    assert_eq!(h.metrics.counter(names::STEP_RETRIES), 2);
    assert_eq!(
        h.event_types(),
        vec![
            "step.started",
            "step.retrying",
            "step.started",
            "step.retrying",
            "step.started",
            "step.completed",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_delay_separates_attempts() {
    let h = TestHarness::new();
    let step = Arc::new(
        ScriptedStep::new("slowpoke")
            .with_config(retrying(2).with_retry_delay_ms(250))
            .then_raise("boom")
            .then_text("ok"),
    );

    h.ctx
        .orchestrator()
        .run_step(&StepNode::new(step.clone()), &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    let starts = step.started_at();
    assert_eq!(starts[1] - starts[0], Duration::from_millis(250));
    // a raised fault leaves no result to hand back
    assert_eq!(step.previous_seen(), vec![false, false]);
}

#[tokio::test(start_paused = true)]
async fn test_never_exceeds_max_attempts() {
    let h = TestHarness::new();
    let step = Arc::new(ScriptedStep::new("broken").with_config(retrying(2)).then_report("nope"));

    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(step.clone()), &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_failed_with(&result, StepErrorKind::Business);
    assert_eq!(step.call_count(), 2);
    assert_eq!(
        step_events(&h.events.events(), "broken").last(),
        Some(&EventKind::StepFailed {
            step: "broken".into(),
            attempts: 2,
            error: "nope".into(),
        })
    );
    assert!(h.ctx.result("broken").is_some_and(|r| r.has_error()));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_retry_succeeds() {
    let h = TestHarness::new();
    let step = Arc::new(
        ScriptedStep::new("sleepy")
            .with_config(retrying(2).with_timeout_ms(1_000))
            .then(StepOutcome::Hang(Duration::from_secs(5), text("late")))
            .then_text("fast"),
    );

    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(step.clone()), &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_text(&result, "fast");
    let starts = step.started_at();
    assert_eq!(starts[1] - starts[0], Duration::from_millis(1_100));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_exhausted_is_timeout_error() {
    let h = TestHarness::new();
    let step = ScriptedStep::new("stuck")
        .with_config(retrying(1).with_timeout_ms(500))
        .then(StepOutcome::Hang(Duration::from_secs(60), text("never")));

    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(Arc::new(step)), &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_failed_with(&result, StepErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_comes_from_orchestrator() {
    let h = TestHarness::with_config(OrchestratorConfig::new().with_default_step_timeout_ms(2_000));
    let step = ScriptedStep::new("stuck")
        .with_config(StepConfig::default().with_default_timeout())
        .then(StepOutcome::Hang(Duration::from_secs(3), text("never")));

    let started = tokio::time::Instant::now();
    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(Arc::new(step)), &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_failed_with(&result, StepErrorKind::Timeout);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn test_contract_violation_propagates_without_retry() {
    let h = TestHarness::new();
    let step = Arc::new(ScriptedStep::new("typed").with_config(retrying(3)).then(StepOutcome::Violate));
    let pipeline = Pipeline::builder("strict").step_arc(step.clone()).build().unwrap();

    let err = pipeline.run(text("not json"), &h.ctx, &h.cancel).await.unwrap_err();

    let AgentflowError::ContractViolation(violation) = err else {
        panic!("expected contract violation, got {err:?}");
    };
    assert_eq!(violation.side, ContractSide::Input);
    assert_eq!(step.call_count(), 1);
    assert!(h.ctx.result("typed").is_none());
    assert_eq!(h.metrics.counter(names::PIPELINE_ERRORS), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_validation_keeps_value() {
    let h = TestHarness::new();
    let step = Arc::new(ScriptedStep::new("draft").with_config(retrying(2)).then_text("tiny"));
    let validator = FnValidator::new("min-length", |result: &StepResult| {
        match result.value().and_then(StepValue::as_text) {
            Some(t) if t.len() >= 10 => Validation::Valid,
            _ => Validation::invalid("reply too short"),
        }
    });
    let node = StepNode::new(step.clone()).with_validator(Arc::new(validator));

    let result = h
        .ctx
        .orchestrator()
        .run_step(&node, &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_failed_with(&result, StepErrorKind::Validation);
    assert_text(&result, "tiny");
    assert_eq!(step.call_count(), 2);
    assert_eq!(step.previous_seen(), vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_validation_passes_on_retry() {
    let h = TestHarness::new();
    let step = ScriptedStep::new("draft")
        .with_config(retrying(3))
        .then_text("tiny")
        .then_text("long enough now");
    let pipeline = Pipeline::builder("writer")
        .step_with_validator(
            step,
            FnValidator::new("min-length", |result: &StepResult| {
                match result.value().and_then(StepValue::as_text) {
                    Some(t) if t.len() >= 10 => Validation::Valid,
                    _ => Validation::invalid("reply too short"),
                }
            }),
        )
        .build()
        .unwrap();

    let result = pipeline.run(text("in"), &h.ctx, &h.cancel).await.unwrap();

    assert_text(&result, "long enough now");
    let retry = h.events.events_of_type("step.retrying");
    assert_eq!(
        retry[0].kind,
        EventKind::StepRetrying {
            step: "draft".into(),
            attempt: 1,
            delay_ms: 100,
            reason: "reply too short".into(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_wait() {
    let h = TestHarness::new();
    let step = Arc::new(
        ScriptedStep::new("patient")
            .with_config(retrying(5).with_retry_delay_ms(10_000))
            .then_report("not yet"),
    );

    let cancel = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(step.clone()), &text("in"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_failed_with(&result, StepErrorKind::Cancelled);
    assert_eq!(step.call_count(), 1);
}

#[tokio::test]
async fn test_values_thread_through_sequence() {
    let h = TestHarness::new();
    let upper = FnStep::sync("upper", |input| {
        Ok(text(&input.as_text().unwrap_or_default().to_uppercase()))
    });
    let check = Arc::new(ScriptedStep::new("check"));
    let pipeline = Pipeline::builder("chain")
        .step(upper)
        .step_arc(check.clone())
        .build()
        .unwrap();

    let result = pipeline.run(text("quiet"), &h.ctx, &h.cancel).await.unwrap();

    assert_succeeded(&result);
    assert_eq!(check.inputs()[0].as_text(), Some("QUIET"));
    assert_eq!(h.ctx.result_paths(), vec!["check".to_string(), "upper".to_string()]);
}

#[tokio::test]
async fn test_sequence_stops_at_first_failure() {
    let h = TestHarness::new();
    let after = Arc::new(ScriptedStep::new("after"));
    let pipeline = Pipeline::builder("halting")
        .step(ScriptedStep::new("fails").then_report("bad input"))
        .step_arc(after.clone())
        .build()
        .unwrap();

    let result = pipeline.run(text("in"), &h.ctx, &h.cancel).await.unwrap();

    assert_failed_with(&result, StepErrorKind::Business);
    assert_eq!(result.step_name(), "fails");
    assert_eq!(after.call_count(), 0);
    assert_eq!(h.metrics.counter(names::PIPELINE_ERRORS), 1);
    assert!(matches!(
        h.events.events().last().map(|e| e.kind.clone()),
        Some(EventKind::PipelineCompleted { success: false, .. })
    ));
}

#[tokio::test]
async fn test_router_splices_follow_ups_in_order() {
    let h = TestHarness::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let router = RouterStep::new("route", |input: &StepValue, _ctx: &ExecutionContext| {
        input.as_text().map(str::to_string)
    })
    .route(
        "billing",
        vec![Arc::new(logged("invoice", &log)), Arc::new(logged("receipt", &log))],
    )
    .fallback(vec![Arc::new(logged("faq", &log))]);

    let pipeline = Pipeline::builder("support")
        .step(FnStep::sync("classify", |_| Ok(text("billing"))))
        .step(router)
        .step(logged("goodbye", &log))
        .build()
        .unwrap();

    let result = pipeline.run(text("I was charged twice"), &h.ctx, &h.cancel).await.unwrap();

    assert_text(&result, "goodbye");
    assert_eq!(*log.lock(), vec!["invoice", "receipt", "goodbye"]);
    assert_eq!(
        h.ctx.metadata(&crate::steps::route_metadata_key("route")),
        Some(serde_json::json!("billing"))
    );
}

#[tokio::test]
async fn test_follow_ups_receive_router_input() {
    let h = TestHarness::new();
    let handler = Arc::new(ScriptedStep::new("handler"));
    let handler_step: Arc<dyn Step> = handler.clone();
    let router = RouterStep::new("route", |_: &StepValue, _: &ExecutionContext| None)
        .fallback(vec![handler_step]);
    let pipeline = Pipeline::builder("fallback").step(router).build().unwrap();

    pipeline.run(text("hello"), &h.ctx, &h.cancel).await.unwrap();

    assert_eq!(handler.inputs()[0].as_text(), Some("hello"));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_aggregates_regardless_of_completion_order() {
    let h = TestHarness::new();
    let fan = ParallelStep::new("fan")
        .branch(Branch::single(remember("A", 30)))
        .branch(Branch::single(remember("B", 20)))
        .branch(Branch::single(remember("C", 10)));
    let pipeline = Pipeline::builder("fanout").step(fan).build().unwrap();

    let result = pipeline.run(text("go"), &h.ctx, &h.cancel).await.unwrap();

    let Some(StepValue::Parallel(branches)) = result.value() else {
        panic!("expected parallel value, got {:?}", result.value());
    };
    assert_eq!(branches.len(), 3);
    assert_eq!(branches.names(), vec!["A", "B", "C"]);
    assert_text(&branches.get("B").unwrap(), "fan/B/B");
    assert!(h.ctx.result("fan/C/C").is_some());
    assert!(h.ctx.result("fan").is_some());

    let completed: Vec<String> = h
        .events
        .events_of_type("branch.completed")
        .into_iter()
        .map(|e| e.path)
        .collect();
    assert_eq!(completed, vec!["fan/C", "fan/B", "fan/A"]);
}

#[tokio::test]
async fn test_branches_isolate_conversation_but_share_metadata() {
    let h = TestHarness::new();
    h.ctx.push_message(Message::user("shared history"));
    let fan = ParallelStep::new("fan")
        .branch(Branch::single(remember("left", 0)))
        .branch(Branch::single(remember("right", 0)));

    h.ctx
        .orchestrator()
        .run_step(&StepNode::new(Arc::new(fan)), &text("go"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    // each branch saw the shared message plus only its own write
    assert_eq!(h.ctx.metadata("seen.left"), Some(serde_json::json!(2)));
    assert_eq!(h.ctx.metadata("seen.right"), Some(serde_json::json!(2)));
    assert_eq!(h.ctx.conversation_len(), 1);
    assert_eq!(h.ctx.current_path(), "");
}

#[tokio::test(start_paused = true)]
async fn test_failed_branch_does_not_short_circuit_siblings() {
    let h = TestHarness::new();
    let slow = Arc::new(
        ScriptedStep::new("slow").then(StepOutcome::Hang(Duration::from_secs(2), text("late"))),
    );
    let fan = ParallelStep::new("fan")
        .branch(Branch::new("bad").step(Arc::new(ScriptedStep::new("oops").then_report("down"))))
        .branch(Branch::new("good").step(slow.clone()));

    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(Arc::new(fan)), &text("go"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    let branches: &ParallelResult = result.value().and_then(StepValue::as_parallel).unwrap();
    assert_eq!(branches.failed_branches(), vec!["bad"]);
    assert_text(&branches.get("good").unwrap(), "late");
    assert_eq!(slow.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_top_level_cancel_reaches_every_branch() {
    let h = TestHarness::new();
    let stuck = Arc::new(
        ScriptedStep::new("A").then(StepOutcome::Hang(Duration::from_secs(3600), text("never"))),
    );
    let fan = ParallelStep::new("fan")
        .branch(Branch::single(stuck.clone()))
        .branch(Branch::single(remember("B", 0)));
    let pipeline = Pipeline::builder("cancelled").step(fan).build().unwrap();

    let cancel = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    let start = tokio::time::Instant::now();
    let result = pipeline.run(text("go"), &h.ctx, &h.cancel).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_failed_with(&result, StepErrorKind::Cancelled);

    // branch tasks settle on their own once the signal reaches them
    for _ in 0..16 {
        if h.ctx.result("fan/A/A").is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let branch = h.ctx.result("fan/A/A").unwrap();
    assert_failed_with(&branch, StepErrorKind::Cancelled);
    assert_succeeded(&h.ctx.result("fan/B/B").unwrap());
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(stuck.call_count(), 1);
}

#[tokio::test]
async fn test_parallel_branch_runs_sequence_in_order() {
    let h = TestHarness::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let fan = ParallelStep::new("fan").branch(
        Branch::new("steps")
            .step(Arc::new(logged("one", &log)))
            .step(Arc::new(logged("two", &log))),
    );

    let result = h
        .ctx
        .orchestrator()
        .run_step(&StepNode::new(Arc::new(fan)), &text("go"), &h.ctx, &h.cancel)
        .await
        .unwrap();

    assert_eq!(*log.lock(), vec!["one", "two"]);
    let branches = result.value().and_then(StepValue::as_parallel).unwrap();
    assert_text(&branches.get("steps").unwrap(), "two");
}

#[tokio::test]
async fn test_contract_violation_in_branch_propagates() {
    let h = TestHarness::new();
    let fan = ParallelStep::new("fan")
        .branch(Branch::single(Arc::new(ScriptedStep::new("typed").then(StepOutcome::Violate))))
        .branch(Branch::single(remember("fine", 0)));
    let pipeline = Pipeline::builder("strict").step(fan).build().unwrap();

    let err = pipeline.run(text("go"), &h.ctx, &h.cancel).await.unwrap_err();

    assert!(err.is_contract_violation());
    assert!(h.ctx.result("fan/fine/fine").is_some());
}

#[tokio::test]
async fn test_subpipeline_nests_results_under_its_path() {
    let h = TestHarness::new();
    let inner = Pipeline::builder("inner")
        .step(FnStep::sync("shout", |input| {
            Ok(text(&input.as_text().unwrap_or_default().to_uppercase()))
        }))
        .build()
        .unwrap();
    let pipeline = Pipeline::builder("outer")
        .step(SubPipelineStep::new("nested", inner))
        .build()
        .unwrap();

    let result = pipeline.run(text("hey"), &h.ctx, &h.cancel).await.unwrap();

    assert_eq!(result.step_name(), "nested");
    assert_text(&result, "HEY");
    assert!(h.ctx.result("nested/shout").is_some());
    assert!(h.ctx.result("nested").is_some());
}

#[tokio::test]
async fn test_pipeline_events_and_metrics() {
    let h = TestHarness::new();
    let pipeline = Pipeline::builder("greet")
        .step(ScriptedStep::new("a"))
        .step(ScriptedStep::new("b"))
        .build()
        .unwrap();

    pipeline.run(text("hi"), &h.ctx, &h.cancel).await.unwrap();

    let events = h.events.events();
    assert_eq!(events.first().map(PipelineEvent::event_type), Some("pipeline.started"));
    assert_eq!(events.last().map(PipelineEvent::event_type), Some("pipeline.completed"));
    assert!(events.iter().all(|e| e.correlation_id == "test-run"));

    let completed = h.events.events_of_type("step.completed");
    let paths: Vec<&str> = completed.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["a", "b"]);

    assert_eq!(h.metrics.counter(names::PIPELINE_EXECUTIONS), 1);
    assert_eq!(h.metrics.counter(names::PIPELINE_ERRORS), 0);
    assert_eq!(h.metrics.counter_with(names::STEP_EXECUTIONS, &[("step", "b")]), 1);
    assert_eq!(h.metrics.durations(names::STEP_DURATION).len(), 2);
    assert_eq!(h.metrics.durations(names::PIPELINE_DURATION).len(), 1);
}
