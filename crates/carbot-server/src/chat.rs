//! `POST /api/chat` handler.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use carbot_agent::{Orchestrator, TurnEvent};
use carbot_core::protocol::ErrorKind;
use carbot_core::types::{ContentPart, Message, Role};

use crate::state::AppState;
use crate::transport::sse_response;

/// Request body: the full client-owned transcript.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

/// A transcript message as sent by a client.
///
/// Accepts both the parts shape and the plain `content` string shape.
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Value>,
    #[serde(default)]
    pub content: Option<String>,
}

impl InboundMessage {
    /// Convert to a transcript message. System messages are dropped; the
    /// server owns the system prompt.
    pub fn into_message(self, index: usize) -> Result<Option<Message>, String> {
        let role = match self.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => return Ok(None),
            other => return Err(format!("unsupported role '{other}' at message {index}")),
        };

        // Unknown part types (step markers, files) are skipped
        let mut parts: Vec<ContentPart> = self
            .parts
            .into_iter()
            .filter_map(|p| serde_json::from_value(p).ok())
            .collect();
        if parts.is_empty() {
            if let Some(text) = self.content.filter(|t| !t.is_empty()) {
                parts.push(ContentPart::Text { text });
            }
        }

        Ok(Some(Message {
            id: self.id.unwrap_or_else(|| format!("client-{index}")),
            role,
            parts,
        }))
    }
}

impl ChatRequest {
    pub fn into_transcript(self) -> Result<Vec<Message>, String> {
        let mut transcript = Vec::with_capacity(self.messages.len());
        for (index, message) in self.messages.into_iter().enumerate() {
            if let Some(message) = message.into_message(index)? {
                transcript.push(message);
            }
        }
        if transcript.is_empty() {
            return Err("messages must contain at least one user or assistant message".into());
        }
        Ok(transcript)
    }
}

fn bad_request(error: impl Into<String>) -> Response {
    let error = error.into();
    warn!(%error, "Rejected chat request");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error }))).into_response()
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let transcript = match request.into_transcript() {
        Ok(t) => t,
        Err(e) => return bad_request(e),
    };

    let message_id = format!("msg-{}", Uuid::new_v4());
    info!(%message_id, messages = transcript.len(), "Chat request");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_with_timeout(
        state.orchestrator.clone(),
        message_id,
        transcript,
        event_tx,
        state.request_timeout(),
    ));

    sse_response(event_rx)
}

/// Run a turn under the request ceiling. On expiry the turn is dropped and a
/// timeout error closes the stream.
async fn run_with_timeout(
    orchestrator: Arc<Orchestrator>,
    message_id: String,
    transcript: Vec<Message>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
    limit: Duration,
) {
    let timeout_tx = event_tx.clone();
    let turn = orchestrator.run_turn(&message_id, &transcript, event_tx);

    match tokio::time::timeout(limit, turn).await {
        Ok(outcome) => debug!(
            %message_id,
            steps = outcome.steps,
            tool_calls = outcome.tool_calls,
            input_tokens = outcome.input_tokens,
            output_tokens = outcome.output_tokens,
            duration_ms = outcome.duration_ms,
            "Turn complete"
        ),
        Err(_) => {
            warn!(%message_id, limit_secs = limit.as_secs(), "Turn timed out");
            let _ = timeout_tx.send(TurnEvent::Error {
                kind: ErrorKind::Timeout,
                message: format!("Request exceeded {}s", limit.as_secs()),
            });
        }
    }
}
