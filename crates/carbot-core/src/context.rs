//! Model working context, i.e. what a provider sees on each step of a turn.
//!
//! The client transcript is reduced to plain `{role, content}` entries before a
//! turn starts; tool calls and their results are appended as the turn goes.

use serde::{Deserialize, Serialize};

use crate::types::{Message, Role};

/// A single entry of the model working context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEntry {
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
        /// Provider token echoed back with the call (Gemini thought signature).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
    },
}

impl ContextEntry {
    /// Reduce a transcript message to a context entry.
    ///
    /// Only text parts are replayed; reasoning and tool activity from earlier
    /// turns are dropped. Returns `None` for messages without any text.
    pub fn from_message(message: &Message) -> Option<Self> {
        let text = message.text();
        if text.trim().is_empty() {
            return None;
        }
        Some(match message.role {
            Role::User => ContextEntry::User { text },
            Role::Assistant => ContextEntry::Assistant { text },
        })
    }
}

/// Reduce a whole transcript to context entries, preserving order.
pub fn context_from_transcript(messages: &[Message]) -> Vec<ContextEntry> {
    messages.iter().filter_map(ContextEntry::from_message).collect()
}
