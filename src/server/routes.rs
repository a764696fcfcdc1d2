//! Route definitions

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{
    cancel_session, events, get_session, health, load_resource, resource_status, submit_message,
    unload_resource, AppState,
};

/// Create the API router
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Resource lifecycle
        .route("/v1/resource", get(resource_status))
        .route("/v1/resource/load", post(load_resource))
        .route("/v1/resource/unload", post(unload_resource))
        // Sessions
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/messages", post(submit_message))
        .route("/v1/sessions/:id/cancel", post(cancel_session))
        // Event stream
        .route("/v1/events", get(events))
}
