//! Context management for pipeline execution.
//!
//! This module provides:
//! - The run-scoped execution context with branch cloning
//! - Hierarchical result paths
//! - Conversation handles
//! - An explicitly passed context factory

#[cfg(test)]
mod context_tests;
mod conversation;
mod execution;
mod factory;
mod path;

pub use conversation::{Conversation, InMemoryConversation, Message, Role};
pub use execution::ExecutionContext;
pub use factory::ContextFactory;
pub use path::{PathStack, PATH_SEPARATOR};
