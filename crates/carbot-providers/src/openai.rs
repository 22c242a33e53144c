//! OpenAI Chat Completions API provider.
//!
//! Implements streaming chat completions via `/v1/chat/completions`. Any
//! OpenAI-compatible server works through `model.base_url`; local servers may
//! run without a key, in which case no Authorization header is sent.

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

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn openai(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl OpenAiRequest {
    fn from_request(request: &CompletionRequest) -> Self {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(request.messages.iter().cloned());

        Self {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            top_p: request.top_p,
            tools: request.tools.clone().filter(|t| !t.is_empty()),
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    /// Sent by reasoning models on some OpenAI-compatible servers.
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_event(self) -> Result<ModelEvent, ProviderError> {
        let args = if self.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.arguments).map_err(|e| ProviderError::MalformedToolCall {
                tool: self.name.clone(),
                reason: format!("arguments are not valid JSON: {e}"),
            })?
        };
        Ok(ModelEvent::ToolCall {
            id: self.id,
            name: self.name,
            args,
            signature: None,
        })
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        _ => FinishReason::Other,
    }
}

/// Translates Chat Completions chunks into model events.
///
/// Argument fragments are forwarded as they arrive; the complete call is
/// emitted once the choice finishes (or the body ends).
#[derive(Debug, Default)]
struct OpenAiStreamParser {
    tool_calls: Vec<ToolCallAccumulator>,
    ended: bool,
}

impl OpenAiStreamParser {
    fn flush_tool_calls(&mut self) -> Vec<Result<ModelEvent, ProviderError>> {
        self.tool_calls
            .drain(..)
            .filter(|tc| !tc.name.is_empty())
            .map(ToolCallAccumulator::into_event)
            .collect()
    }
}

impl ChunkParser for OpenAiStreamParser {
    fn parse(&mut self, data: &str) -> Vec<Result<ModelEvent, ProviderError>> {
        let data = data.trim();

        // OpenAI terminates with "data: [DONE]"
        if data == "[DONE]" {
            return self.finish();
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, data, "Failed to parse OpenAI chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        // Usage (sent with stream_options.include_usage, after the finish chunk)
        if let Some(usage) = chunk.usage {
            events.push(Ok(ModelEvent::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
            events.push(Ok(ModelEvent::ReasoningDelta { text: reasoning }));
        }

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(Ok(ModelEvent::TextDelta { text: content }));
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            if self.tool_calls.len() <= tc.index {
                self.tool_calls
                    .resize_with(tc.index + 1, ToolCallAccumulator::default);
            }
            let acc = &mut self.tool_calls[tc.index];
            if let Some(id) = tc.id {
                acc.id = id;
            }
            let function = tc.function.unwrap_or_default();
            if let Some(name) = function.name {
                acc.name = name;
            }
            if let Some(args) = function.arguments.filter(|a| !a.is_empty()) {
                acc.arguments.push_str(&args);
                // Unnamed calls are announced whole once the choice ends
                if acc.id.is_empty() {
                    continue;
                }
                events.push(Ok(ModelEvent::ToolCallDelta {
                    id: acc.id.clone(),
                    name: acc.name.clone(),
                    args_delta: args,
                }));
            }
        }

        if let Some(reason) = choice.finish_reason {
            events.extend(self.flush_tool_calls());
            self.ended = true;
            events.push(Ok(ModelEvent::StepEnd {
                finish_reason: map_finish_reason(&reason),
            }));
        }

        events
    }

    fn finish(&mut self) -> Vec<Result<ModelEvent, ProviderError>> {
        if self.ended {
            return Vec::new();
        }
        self.ended = true;
        let mut events = self.flush_tool_calls();
        let finish_reason = if events.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        events.push(Ok(ModelEvent::StepEnd { finish_reason }));
        events
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn api(&self) -> ModelApi {
        ModelApi::OpenAiCompletions
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect()
    }

    fn format_messages(&self, context: &[ContextEntry]) -> Vec<serde_json::Value> {
        let mut messages: Vec<serde_json::Value> = Vec::new();

        for entry in context {
            match entry {
                ContextEntry::User { text } => {
                    messages.push(json!({ "role": "user", "content": text }));
                }
                ContextEntry::Assistant { text } => {
                    messages.push(json!({ "role": "assistant", "content": text }));
                }
                ContextEntry::ToolCall { id, name, args, .. } => {
                    let call = json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": args.to_string(),
                        }
                    });
                    // Calls of one step belong to the preceding assistant message
                    match messages.last_mut() {
                        Some(last) if last["role"] == "assistant" => {
                            match last.get_mut("tool_calls").and_then(|t| t.as_array_mut()) {
                                Some(calls) => calls.push(call),
                                None => last["tool_calls"] = json!([call]),
                            }
                        }
                        _ => messages.push(json!({
                            "role": "assistant",
                            "content": null,
                            "tool_calls": [call],
                        })),
                    }
                }
                ContextEntry::ToolResult { id, content, .. } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": id,
                        "content": content,
                    }));
                }
            }
        }

        messages
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<ModelEventStream, ProviderError> {
        let body = OpenAiRequest::from_request(request);

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Credentials::ApiKey { api_key } = credentials {
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = req_builder.json(&body).send().await?;
        let response = error_for_status(response).await?;

        Ok(model_event_stream(response, OpenAiStreamParser::default()))
    }
}
