//! Axum-based HTTP server.

use std::sync::Arc;

use axum::http::{HeaderValue, Method, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Router, extract::State};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use carbot_core::config::Config;

use crate::chat::chat_handler;
use crate::state::AppState;

/// Router with the chat and health endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server_config().cors_origins);

    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Port to listen on: an explicit override, then `PORT`, then config.
pub fn resolve_port(explicit: Option<u16>, config: &Config) -> u16 {
    explicit
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.trim().parse().ok()))
        .unwrap_or_else(|| config.server_port())
}

/// Start the HTTP server and serve until Ctrl+C.
pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state
        .config
        .server_config()
        .bind
        .clone()
        .unwrap_or_else(|| "0.0.0.0".to_string());

    info!(
        model = state.orchestrator.model(),
        max_steps = state.orchestrator.max_steps(),
        "CarBot server starting"
    );

    let app = build_router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "model": state.orchestrator.model(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
