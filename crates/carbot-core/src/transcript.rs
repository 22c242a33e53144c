//! Client-side transcript reducer.
//!
//! Folds decoded [`StreamFrame`]s into a [`Conversation`]. The fold is pure:
//! replaying the same frames from the same starting conversation always yields
//! the same result, which is what lets a client render partial state
//! progressively and still end up with a coherent transcript.

use serde::{Deserialize, Serialize};

use crate::protocol::{ErrorKind, FinishReason, StreamFrame};
use crate::types::{ContentPart, Message, Role, ToolInvocation, ToolState};

/// State of the most recent assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Idle,
    Streaming,
    Finished {
        reason: FinishReason,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
    /// The user stopped the turn; whatever arrived before stays as-is.
    Cancelled,
}

/// What the UI should indicate while a turn is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Thinking,
    UsingTool(String),
}

/// The ordered transcript of one chat session, owned by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub status: TurnStatus,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a user turn. A new user turn resets the status to idle.
    pub fn push_user(&mut self, id: impl Into<String>, text: impl Into<String>) {
        self.messages.push(Message::user(id, text));
        self.status = TurnStatus::Idle;
    }

    pub fn is_streaming(&self) -> bool {
        self.status == TurnStatus::Streaming
    }

    /// Stop the open turn. The partial assistant message is kept untouched.
    pub fn cancel(mut self) -> Self {
        if self.is_streaming() {
            self.status = TurnStatus::Cancelled;
        }
        self
    }

    /// The assistant message of the open turn, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        if !self.is_streaming() {
            return None;
        }
        self.messages.last().filter(|m| m.role == Role::Assistant)
    }

    pub fn activity(&self) -> Activity {
        let Some(message) = self.streaming_message() else {
            return Activity::Idle;
        };
        match message.parts.last() {
            Some(ContentPart::ToolInvocation(inv)) if inv.state != ToolState::Result => {
                Activity::UsingTool(inv.tool_name.clone())
            }
            _ => Activity::Thinking,
        }
    }

    /// Fold a sequence of frames, in order.
    pub fn replay<'a>(self, frames: impl IntoIterator<Item = &'a StreamFrame>) -> Self {
        frames.into_iter().fold(self, reduce)
    }

    fn open_turn(&mut self, message_id: String) {
        self.messages.push(Message::assistant(message_id));
        self.status = TurnStatus::Streaming;
    }

    /// The assistant message under construction, opening one if needed.
    fn current_message(&mut self) -> &mut Message {
        let needs_open = !self.is_streaming()
            || self
                .messages
                .last()
                .is_none_or(|m| m.role != Role::Assistant);
        if needs_open {
            // Frames without a preceding `start` get a positional id so the
            // fold stays deterministic.
            let id = format!("msg-{}", self.messages.len());
            self.open_turn(id);
        }
        let last = self.messages.len() - 1;
        &mut self.messages[last]
    }
}

/// Apply one frame to the conversation.
pub fn reduce(mut conversation: Conversation, frame: &StreamFrame) -> Conversation {
    match frame {
        StreamFrame::Start { message_id } => {
            let already_open = conversation.is_streaming()
                && conversation
                    .messages
                    .last()
                    .is_some_and(|m| m.role == Role::Assistant && &m.id == message_id);
            if !already_open {
                conversation.open_turn(message_id.clone());
            }
        }
        StreamFrame::StartStep { .. } | StreamFrame::FinishStep { .. } => {
            conversation.current_message();
        }
        StreamFrame::TextDelta { delta } => {
            let message = conversation.current_message();
            match message.parts.last_mut() {
                Some(ContentPart::Text { text }) => text.push_str(delta),
                _ => message.parts.push(ContentPart::Text {
                    text: delta.clone(),
                }),
            }
        }
        StreamFrame::ReasoningDelta { delta } => {
            let message = conversation.current_message();
            match message.parts.last_mut() {
                Some(ContentPart::Reasoning { text }) => text.push_str(delta),
                _ => message.parts.push(ContentPart::Reasoning {
                    text: delta.clone(),
                }),
            }
        }
        StreamFrame::ToolInputDelta {
            tool_call_id,
            tool_name,
            input_text_delta,
        } => {
            let message = conversation.current_message();
            match find_invocation(message, tool_call_id) {
                Some(inv) => {
                    inv.push_args_text(input_text_delta);
                }
                None => {
                    let mut inv = ToolInvocation::partial(tool_call_id, tool_name);
                    inv.push_args_text(input_text_delta);
                    message.parts.push(ContentPart::ToolInvocation(inv));
                }
            }
        }
        StreamFrame::ToolCall {
            tool_call_id,
            tool_name,
            args,
        } => {
            let message = conversation.current_message();
            match find_invocation(message, tool_call_id) {
                Some(inv) => {
                    inv.advance_to_call(args.clone());
                }
                None => message
                    .parts
                    .push(ContentPart::ToolInvocation(ToolInvocation::call(
                        tool_call_id,
                        tool_name,
                        args.clone(),
                    ))),
            }
        }
        StreamFrame::ToolResult {
            tool_call_id,
            result,
            ..
        } => {
            // A result for a call we never saw cannot be placed; drop it
            let message = conversation.current_message();
            if let Some(inv) = find_invocation(message, tool_call_id) {
                inv.set_result(result.clone());
            }
        }
        StreamFrame::Finish { finish_reason } => {
            conversation.current_message();
            conversation.status = TurnStatus::Finished {
                reason: *finish_reason,
            };
        }
        StreamFrame::Error { kind, message } => {
            conversation.current_message();
            conversation.status = TurnStatus::Failed {
                kind: *kind,
                message: message.clone(),
            };
        }
    }
    conversation
}

fn find_invocation<'a>(message: &'a mut Message, tool_call_id: &str) -> Option<&'a mut ToolInvocation> {
    message.parts.iter_mut().find_map(|p| match p {
        ContentPart::ToolInvocation(inv) if inv.tool_call_id == tool_call_id => Some(inv),
        _ => None,
    })
}
