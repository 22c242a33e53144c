//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROVIDER: &str = "google";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_SEARCH_API_URL: &str = "https://api.duckduckgo.com";

/// Top-level CarBot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Model provider and sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider id: "google" (default) or "openai".
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Ask Gemini to stream its thought summaries as reasoning parts.
    #[serde(default)]
    pub include_thoughts: bool,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            api_key_env: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            include_thoughts: false,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: `api_key`, then `api_key_env`, then the provider's
    /// well-known environment variables.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).or_else(|| {
            provider_key_envs(&self.provider)
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        })
    }
}

/// Environment variables consulted for a provider's API key, in order.
pub fn provider_key_envs(provider: &str) -> &'static [&'static str] {
    match provider {
        "google" => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        _ => &[],
    }
}

/// Orchestration loop settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model invocations allowed per user turn (default: 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Cap on a tool result re-injected into the model context (default: 4000 chars).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_result_chars: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Base URL of the search API (DuckDuckGo Instant Answer compatible).
    #[serde(default = "default_search_api_url")]
    pub search_api_url: String,

    /// Maximum related results returned after the summary (default: 5).
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Timeout for one search request in seconds (default: 10).
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

fn default_search_api_url() -> String {
    DEFAULT_SEARCH_API_URL.into()
}

fn default_max_results() -> usize {
    5
}

fn default_search_timeout() -> u64 {
    10
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_api_url: default_search_api_url(),
            max_results: default_max_results(),
            search_timeout_secs: default_search_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Hard wall-clock ceiling for one chat request (default: 60s).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Origins allowed by CORS.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    60
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            request_timeout_secs: default_request_timeout(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "carbot_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::CarbotError::Io)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::CarbotError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// The model section, or its defaults.
    pub fn model_config(&self) -> ModelConfig {
        self.model.clone().unwrap_or_default()
    }

    pub fn provider_id(&self) -> String {
        self.model
            .as_ref()
            .map(|m| m.provider.clone())
            .unwrap_or_else(default_provider)
    }

    pub fn model_name(&self) -> String {
        self.model
            .as_ref()
            .and_then(|m| m.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.model
            .as_ref()
            .and_then(|m| m.max_tokens)
            .unwrap_or(2048)
    }

    pub fn temperature(&self) -> Option<f64> {
        Some(
            self.model
                .as_ref()
                .and_then(|m| m.temperature)
                .unwrap_or(0.7),
        )
    }

    pub fn top_p(&self) -> Option<f64> {
        Some(self.model.as_ref().and_then(|m| m.top_p).unwrap_or(0.9))
    }

    pub fn top_k(&self) -> Option<u32> {
        Some(self.model.as_ref().and_then(|m| m.top_k).unwrap_or(40))
    }

    pub fn max_steps(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_steps)
            .unwrap_or(3)
    }

    pub fn max_tool_result_chars(&self) -> usize {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tool_result_chars)
            .unwrap_or(4000)
    }

    pub fn tools_config(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    pub fn server_config(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn server_port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port).unwrap_or_else(default_port)
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.server
            .as_ref()
            .map(|s| s.request_timeout_secs)
            .unwrap_or_else(default_request_timeout)
    }

    /// Get a config value by dotted path (e.g. "server.port", "model.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let model = self.model_config();
        if provider_key_envs(&model.provider).is_empty() {
            errors.push(format!("Unknown model provider '{}'", model.provider));
        } else if model.resolve_api_key().is_none() {
            // OpenAI-compatible local servers may run without a key
            let local = model
                .base_url
                .as_deref()
                .is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"));
            if !local {
                warnings.push(format!(
                    "Provider '{}' has no API key configured (set model.api_key or {})",
                    model.provider,
                    provider_key_envs(&model.provider).join(" / ")
                ));
            }
        }

        if self.max_steps() == 0 {
            errors.push("agent.max_steps must be at least 1".to_string());
        }

        if let Some(server) = &self.server {
            if server.port == 0 {
                errors.push("Server port cannot be 0".to_string());
            }
            if server.request_timeout_secs == 0 {
                errors.push("server.request_timeout_secs must be at least 1".to_string());
            }
        }

        if let Some(tools) = &self.tools {
            if !tools.search_api_url.starts_with("http://")
                && !tools.search_api_url.starts_with("https://")
            {
                errors.push(format!(
                    "tools.search_api_url is not an http(s) URL: {}",
                    tools.search_api_url
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for CarBot data: `~/.carbot/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".carbot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_CB_KEY", "g-test-123") };
        let input = r#"{"key": "${TEST_CB_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("g-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_CB_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_CB_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#)); // empty string
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_port(), 8080);
        assert_eq!(config.max_steps(), 3);
        assert_eq!(config.max_tokens(), 2048);
        assert_eq!(config.model_name(), DEFAULT_MODEL);
        assert_eq!(config.provider_id(), "google");
        assert_eq!(config.request_timeout_secs(), 60);
        assert_eq!(config.tools_config().max_results, 5);
        assert_eq!(
            config.server_config().cors_origins,
            vec!["http://localhost:3000".to_string()]
        );
    }

    #[test]
    fn test_load_json5_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // trailing commas and comments are fine
                model: { provider: "openai", model: "gpt-4o-mini", },
                agent: { max_steps: 5 },
                server: { port: 9000 },
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.provider_id(), "openai");
        assert_eq!(config.model_name(), "gpt-4o-mini");
        assert_eq!(config.max_steps(), 5);
        assert_eq!(config.server_port(), 9000);
        // Unset server fields keep their serde defaults
        assert_eq!(config.request_timeout_secs(), 60);
    }

    #[test]
    fn test_load_unparseable_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ model: { provider: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::CarbotError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/carbot/config.json")).unwrap();
        assert!(config.model.is_none());
    }

    #[test]
    fn test_model_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_CB_API_KEY", "from-env") };
        let model = ModelConfig {
            api_key_env: Some("TEST_CB_API_KEY".into()),
            ..ModelConfig::default()
        };
        assert_eq!(model.resolve_api_key(), Some("from-env".into()));

        let model2 = ModelConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_CB_API_KEY".into()),
            ..ModelConfig::default()
        };
        // Direct key takes priority
        assert_eq!(model2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_CB_API_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_unknown_provider_errors() {
        let config = Config {
            model: Some(ModelConfig {
                provider: "carrier-pigeon".into(),
                ..ModelConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("carrier-pigeon")));
    }

    #[test]
    fn test_validate_zero_steps_and_port() {
        let config = Config {
            agent: Some(AgentConfig {
                max_steps: Some(0),
                max_tool_result_chars: None,
            }),
            server: Some(ServerConfig {
                port: 0,
                ..ServerConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 2, "got: {errors:?}");
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ server: { port: 8181 } }"#).unwrap();
        assert_eq!(config.get_path("server.port"), Some(serde_json::json!(8181)));
        assert!(config.get_path("server.nope").is_none());
    }
}
