//! HTTP server for the scheduler
//!
//! REST endpoints over resource lifecycle and session submission, plus an
//! SSE stream of scheduler events.

mod handlers;
mod routes;
mod streaming;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::engine::Scheduler;

pub use handlers::AppState;
pub use routes::api_routes;
pub use streaming::{create_event_stream, event_name};

/// Build the application router
pub fn app(scheduler: Arc<Scheduler>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState::new(scheduler, config.event_keep_alive_secs));

    let mut app = Router::new().merge(api_routes());
    if config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }
    if config.request_logging {
        app = app.layer(TraceLayer::new_for_http());
    }
    app.with_state(state)
}

/// Start the HTTP server
pub async fn start(scheduler: Arc<Scheduler>, config: ServerConfig) -> Result<()> {
    let app = app(scheduler, &config);

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET  /health - Health check");
    tracing::info!("  GET  /v1/resource - Resource status");
    tracing::info!("  POST /v1/resource/load - Load a resource");
    tracing::info!("  POST /v1/resource/unload - Unload the resource");
    tracing::info!("  POST /v1/sessions/:id/messages - Submit a message");
    tracing::info!("  POST /v1/sessions/:id/cancel - Cancel a session's requests");
    tracing::info!("  GET  /v1/sessions/:id - Session history");
    tracing::info!("  GET  /v1/events - Event stream (SSE)");

    axum::serve(listener, app).await?;

    Ok(())
}
