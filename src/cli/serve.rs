//! HTTP server command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use super::load_config;
use crate::backend::EchoEngine;
use crate::engine::Scheduler;
use crate::server;

/// Start the HTTP server
pub async fn serve(
    model: Option<String>,
    port: Option<u16>,
    host: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config.as_deref())?;

    // Flags override the file
    let mut server_config = config.server_or_default();
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(host) = host {
        server_config.host = host;
    }

    let engine = Arc::new(EchoEngine::new(config.echo.clone()));
    let scheduler = Arc::new(Scheduler::new(engine, config));

    // Pre-load resource if specified
    if let Some(model) = model {
        tracing::info!("Pre-loading resource: {}", model);
        let status = scheduler.load_resource(model).await?;
        if let (Some(identity), Some(version)) = (status.identity, status.version) {
            tracing::info!("Resource '{}' loaded ({})", identity, version);
        }
    }

    tracing::info!("Starting server at http://{}", server_config.addr());
    server::start(scheduler, server_config).await?;

    Ok(())
}
