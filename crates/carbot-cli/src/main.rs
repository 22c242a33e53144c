mod client;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use carbot_core::config::Config;
use carbot_core::transcript::TurnStatus;
use carbot_server::AppState;
use carbot_tools::web_search::WebSearchTool;

use crate::client::ChatClient;

#[derive(Parser)]
#[command(
    name = "carbot",
    about = "CarBot: a car-enthusiast chat assistant with live web search",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat server
    Serve {
        /// Port to listen on (default: $PORT, then config, then 8080)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Chat with a running server (one-shot or interactive)
    Chat {
        /// Server base URL (default: http://127.0.0.1:<configured port>)
        #[arg(long)]
        url: Option<String>,

        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Run a web search directly and print the result
    Search { query: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value (e.g. model.model)
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for w in &warnings {
                warn!("{w}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid configuration: {}", errors.join("; "));
            }

            let port = carbot_server::resolve_port(port, &config);
            info!("Starting CarBot server on port {port}");
            let state = Arc::new(AppState::from_config(config)?);
            carbot_server::start_server(state, port).await?;
        }
        Commands::Chat { url, message } => {
            let url = url.unwrap_or_else(|| format!("http://127.0.0.1:{}", config.server_port()));
            run_chat(&url, message).await?;
        }
        Commands::Search { query } => {
            let tool = WebSearchTool::new(&config.tools_config());
            let outcome = tool.search(&query).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("Config: {}", config_path.display());
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("'{key}' is not set"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("configuration has {} error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
    }

    Ok(())
}

async fn run_chat(url: &str, message: Option<String>) -> anyhow::Result<()> {
    let mut client = ChatClient::new(url);
    let mut stdout = std::io::stdout();

    if let Some(message) = message {
        let status = client.send(&message, &mut stdout, ctrl_c()).await?;
        if let TurnStatus::Failed { .. } = status {
            std::process::exit(1);
        }
        return Ok(());
    }

    println!("CarBot v{} ({url}). Type 'exit' to quit, Ctrl-C stops a reply.", env!("CARGO_PKG_VERSION"));
    loop {
        let input = tokio::task::spawn_blocking(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("you")
                .allow_empty(true)
                .interact_text()
        })
        .await??;

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit") {
            break;
        }

        if let Err(e) = client.send(input, &mut stdout, ctrl_c()).await {
            eprintln!("[error] {e}");
        }
    }

    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
