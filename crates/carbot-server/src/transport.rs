//! Turn events to SSE frames.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use carbot_agent::TurnEvent;
use carbot_core::protocol::{STREAM_CONTENT_TYPE, StreamFrame, encode_frame};

/// Map an orchestrator event to its wire frame. Usage stays server-side.
pub fn frame_for(event: TurnEvent) -> Option<StreamFrame> {
    let frame = match event {
        TurnEvent::Start { message_id } => StreamFrame::Start { message_id },
        TurnEvent::StartStep { step } => StreamFrame::StartStep { step },
        TurnEvent::TextDelta { delta } => StreamFrame::TextDelta { delta },
        TurnEvent::ReasoningDelta { delta } => StreamFrame::ReasoningDelta { delta },
        TurnEvent::ToolInputDelta {
            tool_call_id,
            tool_name,
            delta,
        } => StreamFrame::ToolInputDelta {
            tool_call_id,
            tool_name,
            input_text_delta: delta,
        },
        TurnEvent::ToolCall {
            tool_call_id,
            tool_name,
            args,
        } => StreamFrame::ToolCall {
            tool_call_id,
            tool_name,
            args,
        },
        TurnEvent::ToolResult {
            tool_call_id,
            tool_name,
            result,
            ..
        } => StreamFrame::ToolResult {
            tool_call_id,
            tool_name,
            result,
        },
        TurnEvent::FinishStep {
            step,
            finish_reason,
        } => StreamFrame::FinishStep {
            step,
            finish_reason,
        },
        TurnEvent::Finish { finish_reason } => StreamFrame::Finish { finish_reason },
        TurnEvent::Error { kind, message } => StreamFrame::Error { kind, message },
        TurnEvent::Usage { .. } => return None,
    };
    Some(frame)
}

/// Encoded SSE chunks for every event the turn sends.
///
/// Dropping the returned stream drops the receiver, which cancels the turn.
pub fn frame_stream(
    rx: mpsc::UnboundedReceiver<TurnEvent>,
) -> impl Stream<Item = Result<String, Infallible>> {
    UnboundedReceiverStream::new(rx)
        .filter_map(frame_for)
        .map(|frame| Ok(encode_frame(&frame)))
}

/// Streaming response carrying the turn's frames.
pub fn sse_response(rx: mpsc::UnboundedReceiver<TurnEvent>) -> Response {
    let mut response = Body::from_stream(frame_stream(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(STREAM_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
