//! HTTP server command: `conductor serve`.

use std::sync::Arc;

use anyhow::Result;
use conductor::config::ConductorToml;
use conductor::server::{AppState, ServerConfig, start_server};

pub async fn cmd_serve(
    config: &ConductorToml,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "Configuration warning");
    }

    let mut server = ServerConfig::from(&config.server);
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(port) = port {
        server.port = port;
    }
    server.dev_mode |= dev;

    let state = Arc::new(AppState::from_config(config)?);
    start_server(server, state).await
}
