//! Model gateway: one provider plus the settings every step is sent with.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use carbot_core::config::Config;
use carbot_core::context::ContextEntry;

use crate::schema::validate_tool_call;
use crate::{
    CompletionRequest, Credentials, LlmProvider, ModelEvent, ModelEventStream, ProviderError,
    ToolDefinition, create_provider,
};

/// Sampling and identity settings applied to every request.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub include_thoughts: bool,
}

impl ModelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model_name(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            top_p: config.top_p(),
            top_k: config.top_k(),
            include_thoughts: config.model_config().include_thoughts,
        }
    }
}

/// Streams model steps and validates tool calls before they reach the caller.
#[derive(Clone)]
pub struct ModelGateway {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    settings: ModelSettings,
}

impl ModelGateway {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        settings: ModelSettings,
    ) -> Self {
        Self {
            provider,
            credentials,
            settings,
        }
    }

    /// Build the gateway for the configured provider.
    ///
    /// A missing API key is not an error here; the provider rejects the
    /// request when a key is required.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let model_config = config.model_config();
        let provider = create_provider(&model_config)?;
        let credentials = match model_config.resolve_api_key() {
            Some(api_key) => Credentials::ApiKey { api_key },
            None => {
                warn!(provider = %model_config.provider, "No API key configured");
                Credentials::None
            }
        };
        Ok(Self::new(
            provider,
            credentials,
            ModelSettings::from_config(config),
        ))
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Stream one model step over the given context.
    ///
    /// Every complete tool call is checked against `tools`; a call that does
    /// not match its schema becomes a [`ProviderError::MalformedToolCall`].
    pub async fn stream(
        &self,
        system_prompt: &str,
        context: &[ContextEntry],
        tools: &[ToolDefinition],
    ) -> Result<ModelEventStream, ProviderError> {
        let formatted_tools = self.provider.format_tools(tools);
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: self.provider.format_messages(context),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            top_k: self.settings.top_k,
            tools: (!formatted_tools.is_empty()).then_some(formatted_tools),
            system: Some(system_prompt.to_string()).filter(|s| !s.is_empty()),
            include_thoughts: self.settings.include_thoughts,
        };

        debug!(
            provider = self.provider.id(),
            model = %request.model,
            entries = context.len(),
            "Opening model step"
        );

        let stream = self.provider.stream(&request, &self.credentials).await?;
        let declared = tools.to_vec();

        Ok(Box::pin(stream.map(move |item| match item {
            Ok(ModelEvent::ToolCall {
                id,
                name,
                args,
                signature,
            }) => {
                validate_tool_call(&declared, &name, &args)?;
                Ok(ModelEvent::ToolCall {
                    id,
                    name,
                    args,
                    signature,
                })
            }
            other => other,
        })))
    }
}
