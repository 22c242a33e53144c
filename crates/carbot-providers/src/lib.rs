//! LLM provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to turn a completion
//! request into a stream of [`ModelEvent`]s. The [`gateway::ModelGateway`]
//! wraps a provider with the configured model settings and validates every
//! tool call against the declared tools before it reaches the agent.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use carbot_core::config::ModelConfig;
use carbot_core::context::ContextEntry;
use carbot_core::protocol::{ErrorKind, FinishReason};

pub mod gateway;
pub mod google;
pub mod openai;
pub mod schema;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod sse;

pub use gateway::{ModelGateway, ModelSettings};

/// Supported LLM API protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelApi {
    GoogleGenerativeAi,
    OpenAiCompletions,
    Scripted,
}

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    #[serde(rename = "none")]
    None,
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A request to the LLM for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub tools: Option<Vec<serde_json::Value>>,
    pub system: Option<String>,
    pub include_thoughts: bool,
}

/// One incremental event of a model step.
///
/// The end of the stream is the stream-end signal; `StepEnd` carries the
/// provider's finish reason when it reports one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    /// Fragment of a tool call's arguments while they are still streaming.
    /// Only emitted once the provider has named the call.
    ToolCallDelta {
        id: String,
        name: String,
        args_delta: String,
    },
    /// A complete tool call request. `id` is empty when the provider assigned
    /// none; the orchestrator names such calls.
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
        /// Opaque provider token that must be sent back with the call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    StepEnd {
        finish_reason: FinishReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("malformed call to tool '{tool}': {reason}")]
    MalformedToolCall { tool: String, reason: String },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Error taxonomy used on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Network(_) | ProviderError::Stream(_) => ErrorKind::Network,
            ProviderError::Api { .. } | ProviderError::Auth(_) => ErrorKind::Provider,
            ProviderError::MalformedToolCall { .. } => ErrorKind::Schema,
            ProviderError::Config(_) => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

pub type ModelEventStream =
    Pin<Box<dyn Stream<Item = Result<ModelEvent, ProviderError>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "google", "openai").
    fn id(&self) -> &str;

    /// API protocol used by this provider.
    fn api(&self) -> ModelApi;

    /// Convert tool definitions to the provider's declaration format.
    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value>;

    /// Convert the model working context to the provider's message format.
    fn format_messages(&self, context: &[ContextEntry]) -> Vec<serde_json::Value>;

    /// Stream one model step.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> Result<ModelEventStream, ProviderError>;
}

/// Build the provider named by the model config.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match config.provider.as_str() {
        "google" => Ok(Arc::new(google::GeminiProvider::new(
            config.base_url.as_deref(),
        ))),
        "openai" => Ok(Arc::new(openai::OpenAiProvider::openai(
            config.base_url.as_deref(),
        ))),
        other => Err(ProviderError::Config(format!("unknown provider '{other}'"))),
    }
}
