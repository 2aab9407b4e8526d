//! Conversation handles owned by execution contexts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instructions.
    System,
    /// End user.
    User,
    /// Model output.
    Assistant,
    /// Tool output fed back to the model.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The author.
    pub role: Role,
    /// The message content.
    pub content: String,
    /// Optional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a new message.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// An opaque conversation handle.
///
/// The engine never interprets message content; it only asks for the
/// messages to send with a request and deep-copies the handle for branches.
pub trait Conversation: Send + Sync + fmt::Debug {
    /// Messages to include in the next generation request, in order.
    fn messages_for_request(&self) -> Vec<Message>;

    /// Appends a message.
    fn push(&mut self, message: Message);

    /// Returns an independent copy.
    fn clone_box(&self) -> Box<dyn Conversation>;

    /// Number of stored messages.
    fn len(&self) -> usize;

    /// Returns true if no messages are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for Box<dyn Conversation> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// In-memory conversation with an optional system prompt and history window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryConversation {
    messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_history: Option<usize>,
}

impl InMemoryConversation {
    /// Creates a new empty conversation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation with messages.
    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Sets the system prompt, always sent first.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Limits requests to the most recent `n` messages.
    #[must_use]
    pub fn with_max_history(mut self, n: usize) -> Self {
        self.max_history = Some(n);
        self
    }

    /// All stored messages.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the last user message content, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

impl Conversation for InMemoryConversation {
    fn messages_for_request(&self) -> Vec<Message> {
        let start = self
            .max_history
            .map_or(0, |n| self.messages.len().saturating_sub(n));

        self.system_prompt
            .iter()
            .map(|p| Message::system(p.clone()))
            .chain(self.messages[start..].iter().cloned())
            .collect()
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn clone_box(&self) -> Box<dyn Conversation> {
        Box::new(self.clone())
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}
