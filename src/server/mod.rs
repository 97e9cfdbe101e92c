//! HTTP surface: JSON control API plus SSE and WebSocket event streams.

pub mod api;
pub mod sse;
pub mod ws;

use anyhow::{Context, Result};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use conductor_common::RunId;
use tower_http::cors::CorsLayer;

use crate::config::ServerSection;
pub use api::{AppState, SharedState};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::from(&ServerSection::default())
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
            dev_mode: section.dev_mode,
        }
    }
}

/// The last frame of every event stream.
pub fn end_frame(run_id: RunId) -> serde_json::Value {
    serde_json::json!({"kind": "end", "run_id": run_id})
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Not found"})),
    )
}

/// Serve until Ctrl+C.
pub async fn start_server(config: ServerConfig, state: SharedState) -> Result<()> {
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, dev_mode = config.dev_mode, "Conductor listening");
    println!("Conductor running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
