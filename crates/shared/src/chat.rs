//! Chat wire types
//!
//! The chat endpoint answers either with a single JSON envelope (a tool
//! invocation or a plain message) or with an event stream whose `data:` lines
//! carry OpenAI-style incremental chunks.

use serde::{Deserialize, Serialize};

use crate::types::TicketSlug;

/// Author role within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of the conversation sent as context with every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
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

/// Body of a tool-enabled chat request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ConversationMessage>,
    pub enable_tool_calling: bool,
}

/// Kind of a non-streaming chat reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEnvelopeKind {
    /// The assistant invoked a tool (currently: created a ticket)
    ToolCall,
    /// A complete plain-text answer
    Message,
}

/// Non-streaming chat reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(rename = "type")]
    pub kind: ChatEnvelopeKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_slug: Option<TicketSlug>,
}

/// One `data:` payload of a streamed reply
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub delta: Option<ChatDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatStreamChunk {
    /// Incremental text of the first choice (empty when absent)
    pub fn delta_text(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .and_then(|d| d.content.as_deref())
            .unwrap_or("")
    }
}
