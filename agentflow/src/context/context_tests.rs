//! Comprehensive tests for context module.

#[cfg(test)]
mod tests {
    use crate::context::{
        ContextFactory, Conversation, ExecutionContext, InMemoryConversation, Message,
    };
    use crate::core::StepResult;
    use crate::events::{CollectingEventSink, EventKind, EventSink, EventSinkError, PipelineEvent};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn send(
            &self,
            _event: &PipelineEvent,
            _cancel: &CancellationToken,
        ) -> Result<bool, EventSinkError> {
            Err(EventSinkError("collector unreachable".into()))
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl EventSink for PanickingSink {
        async fn send(
            &self,
            _event: &PipelineEvent,
            _cancel: &CancellationToken,
        ) -> Result<bool, EventSinkError> {
            panic!("sink bug");
        }
    }

    fn started() -> EventKind {
        EventKind::PipelineStarted {
            pipeline: "p".into(),
        }
    }

    #[test]
    fn test_path_stack_scenario() {
        let ctx = ExecutionContext::new();
        ctx.push_path("a");
        ctx.push_path("b");
        assert_eq!(ctx.current_path(), "a/b");

        ctx.pop_path();
        ctx.pop_path();
        assert_eq!(ctx.current_path(), "");

        assert_eq!(ctx.pop_path(), None);
        assert_eq!(ctx.current_path(), "");
    }

    #[test]
    fn test_branch_conversation_is_isolated() {
        let ctx = ExecutionContext::new()
            .with_conversation(Box::new(InMemoryConversation::with_messages(vec![
                Message::user("hello"),
            ])));

        let branch = ctx.branch();
        branch.push_message(Message::assistant("branch reply"));

        assert_eq!(ctx.conversation_len(), 1);
        assert_eq!(branch.conversation_len(), 2);

        ctx.push_message(Message::user("original only"));
        assert_eq!(branch.conversation_len(), 2);
    }

    #[test]
    fn test_branch_metadata_is_shared_both_ways() {
        let ctx = ExecutionContext::new();
        let branch = ctx.branch();

        branch.set_metadata("from_branch", json!(1));
        assert_eq!(ctx.metadata("from_branch"), Some(json!(1)));

        ctx.set_metadata("from_parent", json!("x"));
        assert_eq!(branch.metadata("from_parent"), Some(json!("x")));
    }

    #[test]
    fn test_branch_results_are_shared() {
        let ctx = ExecutionContext::new();
        let branch = ctx.branch();
        branch.store_result("fan/a/step", StepResult::message("step", "ok"));
        assert!(ctx.result("fan/a/step").is_some());
    }

    #[test]
    fn test_branch_path_is_independent() {
        let ctx = ExecutionContext::new();
        ctx.push_path("fan");

        let branch = ctx.branch();
        assert_eq!(branch.current_path(), "fan");

        branch.push_path("a");
        assert_eq!(branch.current_path(), "fan/a");
        assert_eq!(ctx.current_path(), "fan");
    }

    #[tokio::test]
    async fn test_send_event_stamps_context() {
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = ExecutionContext::new()
            .with_correlation_id("run-7")
            .with_event_sink(sink.clone());
        ctx.push_path("outer");

        assert!(ctx.send_event(started(), &CancellationToken::new()).await);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "run-7");
        assert_eq!(events[0].path, "outer");
    }

    #[tokio::test]
    async fn test_sink_error_is_swallowed() {
        let ctx = ExecutionContext::new().with_event_sink(Arc::new(FailingSink));
        assert!(!ctx.send_event(started(), &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_sink_panic_is_swallowed() {
        let ctx = ExecutionContext::new().with_event_sink(Arc::new(PanickingSink));
        assert!(!ctx.send_event(started(), &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_branch_shares_event_sink() {
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = ExecutionContext::new().with_event_sink(sink.clone());
        let branch = ctx.branch();

        branch.send_event(started(), &CancellationToken::new()).await;
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_factory_builds_fresh_contexts() {
        let sink = Arc::new(CollectingEventSink::new());
        let factory = ContextFactory::new()
            .with_event_sink(sink)
            .with_conversation(|| {
                Box::new(InMemoryConversation::new().with_system_prompt("You are terse."))
            });

        let a = factory.create();
        let b = factory.create_with_id("turn-2");

        assert_ne!(a.correlation_id(), b.correlation_id());
        assert_eq!(b.correlation_id(), "turn-2");
        assert!(a.has_event_sink());

        a.set_metadata("k", json!(true));
        assert_eq!(b.metadata("k"), None);

        let messages = a.messages_for_request();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "You are terse.");
    }

    #[test]
    fn test_with_conversation_mut() {
        let ctx = ExecutionContext::new();
        ctx.with_conversation_mut(|c| c.push(Message::user("typed")));
        let len = ctx.with_conversation_mut(|c: &mut dyn Conversation| c.len());
        assert_eq!(len, 1);
    }
}
