//! Tool implementations for the agent runtime.
//!
//! Tools are capabilities exposed to the LLM during a turn.
//! Each tool implements the [`Tool`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{Instrument, info_span, warn};

use carbot_core::config::Config;
use carbot_providers::ToolDefinition;

pub mod web_search;

pub use web_search::{SearchOutcome, WebSearchTool};

/// Context provided to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Assistant message id of the turn that requested the call.
    pub turn_id: String,
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: serde_json::Value,
    pub is_error: bool,
}

impl ToolOutput {
    /// Error payload in the same shape tools use for recovered failures.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: json!({ "success": false, "results": [], "error": message.into() }),
            is_error: true,
        }
    }
}

/// The core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g., "searchWeb").
    fn name(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in tool configured from `config`.
    pub fn with_defaults(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(WebSearchTool::new(&config.tools_config())));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool declarations for the model request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }

    /// Run a tool by name. Unknown tools and tool failures come back as error
    /// payloads so the model can see them.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> ToolOutput {
        let span = info_span!("tool", tool = name, turn_id = %context.turn_id);
        let Some(tool) = self.get(name) else {
            span.in_scope(|| warn!("Model requested an unknown tool"));
            return ToolOutput::error(format!("Unknown tool: {name}"));
        };
        let result = tool.execute(params, context).instrument(span.clone()).await;
        match result {
            Ok(output) => output,
            Err(e) => {
                span.in_scope(|| warn!(error = %e, "Tool execution failed"));
                ToolOutput::error(e.to_string())
            }
        }
    }
}
