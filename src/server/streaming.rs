//! Server-Sent Events over the scheduler event bus

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::engine::Event;

/// Notice sent when a slow subscriber missed events
#[derive(Serialize)]
pub struct LaggedNotice {
    pub skipped: u64,
}

/// SSE event name for a scheduler event
pub fn event_name(event: &Event) -> &'static str {
    match event {
        Event::ResourceLoadProgress { .. } => "resource_load_progress",
        Event::ResourceLoadCompleted { .. } => "resource_load_completed",
        Event::ResourceLoadFailed { .. } => "resource_load_failed",
        Event::ResourceUnloaded { .. } => "resource_unloaded",
        Event::SessionHistoryChanged { .. } => "session_history_changed",
    }
}

/// Create SSE stream from an event bus subscription
pub fn create_event_stream(
    rx: broadcast::Receiver<Event>,
    keep_alive_secs: u64,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    Sse::new(event_stream(rx)).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(keep_alive_secs.max(1))),
    )
}

/// One SSE event per bus event until the bus closes
fn event_stream(
    mut rx: broadcast::Receiver<Event>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(SseEvent::default().event(event_name(&event)).data(data));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event subscriber lagged, skipped {} event(s)", skipped);
                    let data = serde_json::to_string(&LaggedNotice { skipped }).unwrap_or_default();
                    yield Ok(SseEvent::default().event("lagged").data(data));
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
