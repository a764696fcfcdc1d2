//! Conversational sessions
//!
//! A [`Session`] is owned by the caller. The scheduler only mutates it while
//! binding it to the loaded resource and while resolving its requests.

mod history;

pub use history::{History, Turn, TurnStatus};

use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::engine::{ResourceBinding, ResourceId, ResourceVersion};

/// Caller-chosen session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Serialized history produced by the engine instance that owned it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    /// Identity of the resource that produced the bytes
    pub identity: ResourceId,
}

/// Mutable session state, guarded by the session lock
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub history: History,
    pub binding: Option<ResourceBinding>,
    pub snapshot: Option<Snapshot>,
    pub title: Option<String>,
    /// A summary request for this session is in flight
    pub summarizing: bool,
}

/// Session state in the form the caller's storage layer persists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: SessionId,
    /// Engine-produced snapshot bytes
    #[serde(default)]
    pub snapshot: Option<Vec<u8>>,
    /// Identity of the resource the snapshot was taken under
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// A long-lived conversational identity
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session that has never been bound to a resource
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Recreate a session from persisted state.
    ///
    /// The restored binding points at a version no live resource carries,
    /// so the next submission rehydrates from the snapshot (or rebuilds if
    /// there is none).
    pub fn restore(persisted: PersistedSession) -> Self {
        let identity = persisted.identity.map(ResourceId::new);
        let snapshot = match (persisted.snapshot, identity.clone()) {
            (Some(bytes), Some(identity)) => Some(Snapshot { bytes, identity }),
            (Some(bytes), None) => {
                tracing::warn!(
                    "Dropping {}-byte snapshot of session {}: no resource identity recorded",
                    bytes.len(),
                    persisted.id
                );
                None
            }
            (None, _) => None,
        };
        let binding = identity.map(|identity| ResourceBinding {
            identity,
            version: ResourceVersion::STALE,
        });

        Self {
            id: persisted.id,
            state: Mutex::new(SessionState {
                history: History::default(),
                binding,
                snapshot,
                title: persisted.title,
                summarizing: false,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Copy of the in-memory history
    pub fn history(&self) -> History {
        self.state.lock().history.clone()
    }

    pub fn title(&self) -> Option<String> {
        self.state.lock().title.clone()
    }

    /// Resource this session's history was last bound to
    pub fn binding(&self) -> Option<ResourceBinding> {
        self.state.lock().binding.clone()
    }

    pub fn has_snapshot(&self) -> bool {
        self.state.lock().snapshot.is_some()
    }

    /// Export the state the caller should store
    pub fn persist(&self) -> PersistedSession {
        let state = self.state.lock();
        PersistedSession {
            id: self.id.clone(),
            snapshot: state.snapshot.as_ref().map(|s| s.bytes.clone()),
            identity: state.snapshot.as_ref().map(|s| s.identity.to_string()),
            title: state.title.clone(),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }
}
