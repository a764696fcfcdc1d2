//! Scheduled requests
//!
//! A [`Request`] moves Created -> Waiting -> Running -> Finished and finishes
//! exactly once. Its completion future is a watch channel over that state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::session::SessionId;

/// Monotonic request identifier, unique per scheduler
pub type RequestId = u64;

/// Which scheduler instance a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// User-facing conversational submission
    Chat,
    /// Background summary-title generation
    Summary,
}

/// Outcome classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Completed,
    /// Explicit cancel or deadline expiry
    Cancelled,
    /// The engine reported an error or panicked
    Failed,
    /// Submitted while no resource was loaded
    ResourceUnavailable,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Failed => "failed",
            RequestStatus::ResourceUnavailable => "resource unavailable",
        };
        f.write_str(s)
    }
}

/// Resolved value of a request's completion future
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestResult {
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestResult {
    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            status: RequestStatus::Completed,
            completion: Some(text.into()),
            error: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: RequestStatus::Cancelled,
            completion: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RequestStatus::Failed,
            completion: None,
            error: Some(error.into()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            status: RequestStatus::ResourceUnavailable,
            completion: None,
            error: Some("no resource is loaded".to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RequestStatus::Completed
    }
}

/// Lifecycle state of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Waiting,
    Running,
    Finished(RequestResult),
}

impl RequestState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RequestState::Finished(_))
    }

    pub fn result(&self) -> Option<&RequestResult> {
        match self {
            RequestState::Finished(result) => Some(result),
            _ => None,
        }
    }
}

/// One unit of scheduled work
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    session: SessionId,
    kind: RequestKind,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    state: watch::Sender<RequestState>,
}

impl Request {
    /// Create a request. With a timeout, a deadline task cancels the
    /// request's token when it expires, unless it finished first.
    pub fn new(
        id: RequestId,
        session: SessionId,
        kind: RequestKind,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(RequestState::Created);
        let request = Arc::new(Self {
            id,
            session,
            kind,
            cancel: CancellationToken::new(),
            timed_out: Arc::new(AtomicBool::new(false)),
            state,
        });

        if let Some(timeout) = timeout {
            let token = request.cancel.clone();
            let timed_out = Arc::clone(&request.timed_out);
            let mut finished = request.state.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = finished.wait_for(RequestState::is_finished) => {}
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            });
        }

        request
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Token observed by the queue wait and the engine call
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether cancellation came from the deadline
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RequestState {
        self.state.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }

    pub(crate) fn mark_waiting(&self) {
        self.transition(RequestState::Waiting);
    }

    pub(crate) fn mark_running(&self) {
        self.transition(RequestState::Running);
    }

    /// Resolve the completion future. Returns false if already finished.
    pub(crate) fn finish(&self, result: RequestResult) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_finished() {
                false
            } else {
                *state = RequestState::Finished(result);
                true
            }
        })
    }

    /// Wait until the request has finished
    pub async fn wait(&self) -> RequestResult {
        let mut rx = self.state.subscribe();
        let result = match rx.wait_for(RequestState::is_finished).await {
            Ok(state) => state
                .result()
                .cloned()
                .unwrap_or_else(|| RequestResult::failed("request finished without a result")),
            Err(_) => RequestResult::failed("request state channel closed"),
        };
        result
    }

    fn transition(&self, next: RequestState) {
        self.state.send_if_modified(|state| {
            if state.is_finished() {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}
