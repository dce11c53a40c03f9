//! rust-agent HTTP Server
//!
//! Axum-based server streaming conversation turns over Server-Sent Events
//! and WebSocket.

mod handlers;
mod state;

use axum::{Router, routing::{get, post}};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_runtime::{AdapterFactory, ModelStatus, RuntimeConfig, RuntimeContext};
use agent_tools::DEFAULT_USER_INFO_DIR;

use crate::handlers::{chat_handler, chat_stream_handler, health_check, list_models};
use crate::state::AppState;

/// Router with every endpoint mounted
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))

        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before reading RUST_LOG
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RuntimeConfig::from_env()?;
    let user_info_dir =
        std::env::var("AGENT_USER_INFO_DIR").unwrap_or_else(|_| DEFAULT_USER_INFO_DIR.into());
    let tools = agent_tools::default_registry(user_info_dir)?;

    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    let current = AdapterFactory::entries()
        .filter(|e| e.status == ModelStatus::Current)
        .count();
    tracing::info!(
        default_model = %config.default_model,
        tool_mode = ?config.tool_mode,
        "{current} current models in catalogue"
    );

    let mut context = RuntimeContext::new(config, tools);
    if let Ok(prompt) = std::env::var("AGENT_SYSTEM_PROMPT") {
        context = context.with_system_prompt(prompt);
    }

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("rust-agent server running on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/models      - Model catalogue");
    tracing::info!("  POST /api/chat        - Chat turn (SSE)");
    tracing::info!("  GET  /api/chat/stream - WebSocket streaming");

    axum::serve(listener, app(AppState::new(context))).await?;

    Ok(())
}
