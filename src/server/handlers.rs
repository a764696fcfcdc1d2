//! HTTP request handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::streaming::create_event_stream;
use crate::engine::{RequestResult, RequestStatus, ResourceBinding, ResourceStatus, Scheduler};
use crate::error::SchedulerError;
use crate::session::{History, Session, SessionId};

/// Shared application state
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Sessions created through the API, by id
    pub sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// SSE keep-alive interval in seconds
    pub keep_alive_secs: u64,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, keep_alive_secs: u64) -> Self {
        Self {
            scheduler,
            sessions: RwLock::new(HashMap::new()),
            keep_alive_secs,
        }
    }

    /// Look up a session, creating it on first use
    pub fn session(&self, id: &SessionId) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(id) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Session::new(id.clone()))),
        )
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Resource status and queue depths
pub async fn resource_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ResourceResponse::from_scheduler(&state.scheduler))
}

/// Load a resource
pub async fn load_resource(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoadRequest>,
) -> Response {
    match state.scheduler.load_resource(request.identity).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ResourceResponse::from_scheduler(&state.scheduler)),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Unload the current resource after draining its requests
pub async fn unload_resource(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.unload_resource().await {
        Ok(binding) => (StatusCode::OK, Json(UnloadResponse { unloaded: binding })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Submit a message to a session and wait for the reply
pub async fn submit_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Response {
    let session_id = SessionId::new(id);
    let session = state.session(&session_id);
    let result = state.scheduler.submit(&session, request.prompt).await;

    let code = match result.status {
        RequestStatus::ResourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let response = MessageResponse::new(session_id, result, session.title());
    (code, Json(response)).into_response()
}

/// Cancel a session's outstanding requests
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> impl IntoResponse {
    let await_termination = body.map(|Json(b)| b.await_termination).unwrap_or(true);
    let cancelled = state
        .scheduler
        .cancel(&SessionId::new(id), await_termination)
        .await;
    Json(CancelResponse { cancelled })
}

/// Session history, title and binding
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let session_id = SessionId::new(id);
    let Some(session) = state.sessions.read().get(&session_id).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                format!("Session not found: {}", session_id),
                "not_found",
            )),
        )
            .into_response();
    };

    let response = SessionResponse {
        id: session_id,
        title: session.title(),
        binding: session.binding(),
        has_snapshot: session.has_snapshot(),
        history: session.history(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// Server-Sent Events of every scheduler event
pub async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    create_event_stream(state.scheduler.subscribe(), state.keep_alive_secs)
}

fn error_response(error: &SchedulerError) -> Response {
    let (code, kind) = match error {
        SchedulerError::ResourceBusy { .. } | SchedulerError::NotLoaded => {
            (StatusCode::CONFLICT, "invalid_state")
        }
        SchedulerError::InvalidIdentity(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        SchedulerError::LoadFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "load_error"),
    };
    (code, Json(ErrorResponse::new(error.to_string(), kind))).into_response()
}

// Request/Response types

#[derive(Deserialize)]
pub struct LoadRequest {
    pub identity: String,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub prompt: String,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    #[serde(default = "default_true")]
    pub await_termination: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
pub struct ResourceResponse {
    #[serde(flatten)]
    pub status: ResourceStatus,
    pub primary_queue: usize,
    pub background_queue: usize,
}

impl ResourceResponse {
    fn from_scheduler(scheduler: &Scheduler) -> Self {
        Self {
            status: scheduler.status(),
            primary_queue: scheduler.primary().len(),
            background_queue: scheduler.background().len(),
        }
    }
}

#[derive(Serialize)]
pub struct UnloadResponse {
    pub unloaded: ResourceBinding,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub session: SessionId,
    #[serde(flatten)]
    pub result: RequestResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl MessageResponse {
    fn new(session: SessionId, result: RequestResult, title: Option<String>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            object: "session.message".to_string(),
            created: chrono::Utc::now().timestamp(),
            session,
            result,
            title,
        }
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub id: SessionId,
    pub title: Option<String>,
    pub binding: Option<ResourceBinding>,
    pub has_snapshot: bool,
    pub history: History,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

impl ErrorResponse {
    fn new(message: impl Into<String>, kind: &str) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                r#type: kind.to_string(),
            },
        }
    }
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
}
