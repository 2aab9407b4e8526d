//! # Agentflow
//!
//! The step execution and resilience engine behind multi-step AI agent
//! workflows.
//!
//! Agentflow provides:
//!
//! - **Step execution**: retries, per-attempt timeouts, structural and
//!   semantic validation, finalization and run-time routing
//! - **Execution context**: path-scoped results, shared metadata and
//!   per-branch conversation copies for parallel fan-out
//! - **Resilience primitives**: a circuit breaker and a generic retry policy
//! - **LLM calls**: a client that honours provider rate-limit signals and
//!   guards streams with an inactivity timeout
//! - **Observability**: best-effort lifecycle events, metrics and `tracing`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agentflow::prelude::*;
//!
//! let pipeline = Pipeline::builder("support")
//!     .step(FnStep::sync("classify", |input| Ok(input)))
//!     .step(LlmStep::new("answer", client))
//!     .build()?;
//!
//! let ctx = ContextFactory::new().create();
//! let result = pipeline.run(StepValue::Text("hi".into()), &ctx, &CancellationToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod steps;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{
        ContextFactory, Conversation, ExecutionContext, InMemoryConversation, Message, Role,
    };
    pub use crate::core::{
        bind_fields, bind_template, ActionPayload, Json, ParallelResult, StepPayload, StepResult,
        StepValue, ValueKind,
    };
    pub use crate::errors::{
        AgentflowError, ContractViolationError, PipelineValidationError, StepError, StepErrorKind,
    };
    pub use crate::events::{EventKind, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::llm::{
        GenerationRequest, GenerationResponse, GenerationService, LlmError, LlmRetryConfig,
        ResilientGenerationClient,
    };
    pub use crate::observability::{init_tracing, LogFormat, MetricsSink};
    pub use crate::pipeline::{Orchestrator, OrchestratorConfig, Pipeline, PipelineBuilder, StepNode};
    pub use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
    pub use crate::steps::{
        Branch, FnRouter, FnStep, FnValidator, LlmStep, ParallelStep, RouterStep,
        SemanticValidator, Step, StepConfig, SubPipelineStep, Typed, TypedStep, Validation,
    };
    pub use tokio_util::sync::CancellationToken;
}
