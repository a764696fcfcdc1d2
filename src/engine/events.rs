//! Lifecycle and session events
//!
//! All notifications leave through one [`EventBus`]. Emitting never blocks and
//! never calls back into subscribers, so it is safe mid-transition.

use serde::Serialize;
use tokio::sync::broadcast;

use super::{ResourceId, ResourceVersion};
use crate::session::{SessionId, TurnStatus};

/// How a session's history changed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryChange {
    /// Replaced with a fresh history seeded from configured defaults
    Rebuilt,
    /// Replaced with a history deserialized from the session snapshot
    Rehydrated,
    /// A pending turn was appended
    TurnAdded { index: usize },
    /// A pending turn reached a terminal status
    TurnResolved { index: usize, status: TurnStatus },
    /// Background summarization produced a title
    TitleChanged { title: String },
}

/// Event published by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ResourceLoadProgress {
        identity: ResourceId,
        fraction: f32,
    },
    ResourceLoadCompleted {
        identity: ResourceId,
        version: ResourceVersion,
    },
    ResourceLoadFailed {
        identity: ResourceId,
        error: String,
    },
    ResourceUnloaded {
        identity: ResourceId,
    },
    SessionHistoryChanged {
        session: SessionId,
        change: HistoryChange,
    },
}

/// Single dispatch point for [`Event`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
