//! Conversation state and backend chat sessions.
//!
//! A [`Conversation`] is the ordered history handed to a
//! [`ChatBackend`](crate::providers::ChatBackend); a [`ChatSession`] owns one
//! conversation for the lifetime of a request.

pub mod chat;

pub use chat::{ChatSession, FragmentStream, SessionLimits};

use serde::{Deserialize, Serialize};

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Backend-facing conversation: an optional system instruction followed by
/// alternating user and assistant turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub system_instruction: Option<String>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_instruction: Option<String>) -> Self {
        Self {
            system_instruction: system_instruction.filter(|s| !s.trim().is_empty()),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Content of the most recent user turn.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
