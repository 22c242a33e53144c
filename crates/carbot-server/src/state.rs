//! Shared server state.

use std::sync::Arc;
use std::time::Duration;

use carbot_agent::Orchestrator;
use carbot_core::config::Config;

/// State shared by every request handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// State for the configured provider and the built-in tools.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let orchestrator = Orchestrator::from_config(&config)?;
        Ok(Self::new(config, orchestrator))
    }

    /// Wall-clock ceiling for a single chat turn.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs().max(1))
    }
}
