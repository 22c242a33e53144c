//! Agent runtime: orchestrates one chat turn with a tool-calling loop.
//!
//! The orchestrator takes the client transcript, builds the model context,
//! streams model steps, executes tool calls, and produces a stream of
//! [`TurnEvent`]s for the server to encode.

use serde::{Deserialize, Serialize};

use carbot_core::protocol::{ErrorKind, FinishReason};

pub mod prompt;
pub mod runtime;

pub use runtime::Orchestrator;

/// Events emitted by the orchestrator during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The assistant message for this turn begins.
    Start { message_id: String },

    StartStep { step: u32 },

    TextDelta { delta: String },

    ReasoningDelta { delta: String },

    /// Streaming fragment of a tool call's arguments.
    ToolInputDelta {
        tool_call_id: String,
        tool_name: String,
        delta: String,
    },

    /// A complete, validated tool call.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },

    /// A tool call has completed. `result` is the full, untruncated payload.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },

    FinishStep {
        step: u32,
        finish_reason: FinishReason,
    },

    /// Token usage reported for a step.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    Finish { finish_reason: FinishReason },

    Error { kind: ErrorKind, message: String },
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnEnd {
    Finished { finish_reason: FinishReason },
    Failed { kind: ErrorKind, message: String },
    /// The event receiver went away before the turn completed.
    Cancelled,
}

/// Summary of a completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub message_id: String,
    pub steps: u32,
    pub tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub end: TurnEnd,
}
