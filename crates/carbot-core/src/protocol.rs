//! CarBot chat stream wire protocol.
//!
//! A turn is delivered as Server-Sent Events over a single HTTP response body.
//! Every event carries one JSON [`StreamFrame`]:
//!
//! ```text
//! data: {"type":"text-delta","delta":"The 911 GT3 "}
//!
//! ```
//!
//! `finish` and `error` are terminal. A stream that ends without either was
//! cut short (client cancellation or a dropped connection).

use serde::{Deserialize, Serialize};

use crate::error::{CarbotError, Result};
use crate::sse::SseDecoder;

/// Content type of the streamed response body.
pub const STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// One frame of the chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum StreamFrame {
    /// A new assistant message begins.
    Start { message_id: String },

    /// A model step (one provider invocation) begins.
    StartStep { step: u32 },

    TextDelta { delta: String },

    ReasoningDelta { delta: String },

    /// Streamed fragment of a tool call's arguments (`partial-call`).
    ToolInputDelta {
        tool_call_id: String,
        tool_name: String,
        input_text_delta: String,
    },

    /// The model requested a tool call with complete arguments (`call`).
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },

    /// The tool finished (`result`).
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
    },

    FinishStep {
        step: u32,
        finish_reason: FinishReason,
    },

    Finish { finish_reason: FinishReason },

    Error { kind: ErrorKind, message: String },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Finish { .. } | StreamFrame::Error { .. })
    }
}

/// Why a step or a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    /// The step budget ran out while the model was still calling tools.
    StepLimit,
    Other,
}

/// Error taxonomy carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The model provider could not be reached.
    Network,
    /// The provider answered with an error.
    Provider,
    /// The model produced a tool call that does not match the declared schema.
    Schema,
    /// The turn exceeded its wall-clock budget.
    Timeout,
    Internal,
}

/// Encode a frame as one SSE event.
pub fn encode_frame(frame: &StreamFrame) -> String {
    // StreamFrame only holds strings, numbers and JSON values
    let json = serde_json::to_string(frame).unwrap_or_else(|e| {
        format!(r#"{{"type":"error","kind":"internal","message":"encode failed: {e}"}}"#)
    });
    format!("data: {json}\n\n")
}

/// Incremental decoder for the chat stream.
///
/// Feed raw body chunks as they arrive; each call returns the frames that
/// became complete. Decoding is deterministic: the same bytes always yield the
/// same frames regardless of how they were chunked.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    sse: SseDecoder,
    terminated: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamFrame>> {
        self.sse
            .push(chunk)
            .into_iter()
            .map(|event| self.decode(&event.data))
            .collect()
    }

    /// Flush a final event left without its blank-line terminator.
    pub fn finish(&mut self) -> Option<Result<StreamFrame>> {
        let event = self.sse.finish()?;
        Some(self.decode(&event.data))
    }

    /// Whether a terminal frame (`finish` or `error`) has been decoded.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn decode(&mut self, data: &str) -> Result<StreamFrame> {
        let frame: StreamFrame = serde_json::from_str(data)
            .map_err(|e| CarbotError::Protocol(format!("invalid frame {data:?}: {e}")))?;
        if frame.is_terminal() {
            self.terminated = true;
        }
        Ok(frame)
    }
}
