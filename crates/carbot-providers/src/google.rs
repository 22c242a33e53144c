//! Google Generative AI (Gemini) provider.
//!
//! Implements streaming via the `streamGenerateContent` endpoint with SSE.
//! Auth is via the `x-goog-api-key` header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use carbot_core::context::ContextEntry;
use carbot_core::protocol::FinishReason;

use crate::sse::{ChunkParser, error_for_status, model_event_stream};
use crate::{
    CompletionRequest, Credentials, LlmProvider, ModelApi, ModelEvent, ModelEventStream,
    ProviderError, ToolDefinition,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

// --- Gemini request/response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<serde_json::Value>,
}

impl GeminiRequest {
    fn from_request(request: &CompletionRequest) -> Self {
        Self {
            contents: request.messages.clone(),
            system_instruction: request
                .system
                .as_ref()
                .map(|s| json!({ "parts": [{ "text": s }] })),
            tools: request.tools.clone().filter(|t| !t.is_empty()),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                thinking_config: request
                    .include_thoughts
                    .then(|| json!({ "includeThoughts": true })),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    function_call: Option<FunctionCallPart>,
    /// Thinking models sign their function calls; the signature has to be
    /// sent back with the call on the next step.
    #[serde(default)]
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallPart {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// Map a Gemini `finishReason` to the wire finish reason.
fn map_finish_reason(reason: &str, saw_tool_call: bool) -> FinishReason {
    match reason {
        "STOP" if saw_tool_call => FinishReason::ToolCalls,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Other,
    }
}

/// Translates Gemini SSE chunks into model events.
///
/// Gemini reports usage on every chunk as a running total, so only the last
/// report is emitted, right before the step ends.
#[derive(Debug, Default)]
struct GeminiStreamParser {
    saw_tool_call: bool,
    usage: Option<(u64, u64)>,
    ended: bool,
}

impl GeminiStreamParser {
    fn end_step(&mut self, finish_reason: FinishReason) -> Vec<Result<ModelEvent, ProviderError>> {
        self.ended = true;
        let mut events = Vec::new();
        if let Some((input_tokens, output_tokens)) = self.usage.take() {
            events.push(Ok(ModelEvent::Usage {
                input_tokens,
                output_tokens,
            }));
        }
        events.push(Ok(ModelEvent::StepEnd { finish_reason }));
        events
    }
}

impl ChunkParser for GeminiStreamParser {
    fn parse(&mut self, data: &str) -> Vec<Result<ModelEvent, ProviderError>> {
        let chunk: GeminiStreamChunk = match serde_json::from_str(data.trim()) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, "Failed to parse Gemini chunk");
                return Vec::new();
            }
        };

        if let Some(error) = chunk.error {
            return vec![Err(ProviderError::Api {
                status: error.code,
                body: error.message,
            })];
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some((usage.prompt_token_count, usage.candidates_token_count));
        }

        let mut events = Vec::new();
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return events;
        };

        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(fc) = part.function_call {
                    self.saw_tool_call = true;
                    // Older models leave the id out; the caller names the call
                    events.push(Ok(ModelEvent::ToolCall {
                        id: fc.id.unwrap_or_default(),
                        name: fc.name,
                        args: fc.args.unwrap_or_else(|| json!({})),
                        signature: part.thought_signature.filter(|s| !s.is_empty()),
                    }));
                } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(Ok(if part.thought {
                        ModelEvent::ReasoningDelta { text }
                    } else {
                        ModelEvent::TextDelta { text }
                    }));
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            if reason != "STOP" {
                trace!(reason, "Gemini finish reason");
            }
            let finish_reason = map_finish_reason(&reason, self.saw_tool_call);
            events.extend(self.end_step(finish_reason));
        }

        events
    }

    fn finish(&mut self) -> Vec<Result<ModelEvent, ProviderError>> {
        if self.ended {
            return Vec::new();
        }
        let finish_reason = if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        self.end_step(finish_reason)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        "google"
    }

    fn api(&self) -> ModelApi {
        ModelApi::GoogleGenerativeAi
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        if tools.is_empty() {
            return Vec::new();
        }
        // Gemini wraps tools in a single object with a functionDeclarations array
        let declarations: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                })
            })
            .collect();

        vec![json!({ "functionDeclarations": declarations })]
    }

    fn format_messages(&self, context: &[ContextEntry]) -> Vec<serde_json::Value> {
        // Gemini requires alternating turns, so consecutive entries that map to
        // the same role are merged into one content.
        let mut turns: Vec<(&'static str, Vec<serde_json::Value>)> = Vec::new();

        for entry in context {
            let (role, part) = match entry {
                ContextEntry::User { text } => ("user", json!({ "text": text })),
                ContextEntry::Assistant { text } => ("model", json!({ "text": text })),
                ContextEntry::ToolCall {
                    id,
                    name,
                    args,
                    signature,
                } => {
                    let mut part =
                        json!({ "functionCall": { "id": id, "name": name, "args": args } });
                    if let Some(signature) = signature {
                        part["thoughtSignature"] = json!(signature);
                    }
                    ("model", part)
                }
                ContextEntry::ToolResult { id, name, content } => (
                    "user",
                    json!({
                        "functionResponse": {
                            "id": id,
                            "name": name,
                            "response": { "content": content },
                        }
                    }),
                ),
            };
            match turns.last_mut() {
                Some((last_role, parts)) if *last_role == role => parts.push(part),
                _ => turns.push((role, vec![part])),
            }
        }

        turns
            .into_iter()
            .map(|(role, parts)| json!({ "role": role, "parts": parts }))
            .collect()
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<ModelEventStream, ProviderError> {
        let api_key = match credentials {
            Credentials::ApiKey { api_key } => api_key.clone(),
            Credentials::None => {
                return Err(ProviderError::Auth(
                    "Gemini requires an API key (GOOGLE_API_KEY or GEMINI_API_KEY)".into(),
                ));
            }
        };

        let body = GeminiRequest::from_request(request);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );

        debug!(model = %request.model, "Streaming Gemini API");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        let response = error_for_status(response).await?;

        Ok(model_event_stream(response, GeminiStreamParser::default()))
    }
}
