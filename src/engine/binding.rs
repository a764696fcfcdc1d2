//! Session binding
//!
//! Decides how a session's history attaches to the currently loaded
//! resource before each submission. Runs under the resource gate.

use std::sync::Arc;

use serde::Serialize;

use super::resource::{LoadedResource, ResourceBinding};
use crate::config::SessionConfig;
use crate::session::{History, Session};

/// What to do with a session's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingAction {
    /// History is valid for the current resource
    Reuse,
    /// Replace history with the snapshot deserialized by the current resource
    Rehydrate,
    /// Start over from configured defaults
    Rebuild,
}

/// Reuse/rehydrate/rebuild policy
pub trait BindingPolicy: Send + Sync {
    fn resolve(
        &self,
        last: Option<&ResourceBinding>,
        current: &ResourceBinding,
        has_snapshot: bool,
    ) -> BindingAction;
}

/// Reuse on an exact version match, otherwise rehydrate when a snapshot
/// exists, otherwise rebuild
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotPolicy;

impl BindingPolicy for SnapshotPolicy {
    fn resolve(
        &self,
        last: Option<&ResourceBinding>,
        current: &ResourceBinding,
        has_snapshot: bool,
    ) -> BindingAction {
        match last {
            None => BindingAction::Rebuild,
            Some(last) if last == current => BindingAction::Reuse,
            Some(_) if has_snapshot => BindingAction::Rehydrate,
            Some(_) => BindingAction::Rebuild,
        }
    }
}

/// Applies a [`BindingPolicy`] to sessions
pub struct SessionBinder {
    policy: Arc<dyn BindingPolicy>,
    defaults: SessionConfig,
}

impl SessionBinder {
    pub fn new(policy: Arc<dyn BindingPolicy>, defaults: SessionConfig) -> Self {
        Self { policy, defaults }
    }

    /// Bind `session` to `current` and return the action actually applied.
    ///
    /// A snapshot that fails to deserialize falls back to a rebuild.
    pub fn bind(&self, session: &Session, current: &LoadedResource) -> BindingAction {
        let binding = current.binding();
        let mut state = session.state();
        let action =
            self.policy
                .resolve(state.binding.as_ref(), &binding, state.snapshot.is_some());

        let applied = match action {
            BindingAction::Reuse => BindingAction::Reuse,
            BindingAction::Rehydrate => {
                let restored = state
                    .snapshot
                    .as_ref()
                    .map(|s| current.instance.deserialize_history(&s.bytes));
                match restored {
                    Some(Ok(history)) => {
                        state.history = history;
                        BindingAction::Rehydrate
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            "Snapshot for session {} did not load under '{}': {:#}; rebuilding",
                            session.id(),
                            binding.identity,
                            e
                        );
                        state.history = self.fresh();
                        BindingAction::Rebuild
                    }
                    None => {
                        state.history = self.fresh();
                        BindingAction::Rebuild
                    }
                }
            }
            BindingAction::Rebuild => {
                state.history = self.fresh();
                BindingAction::Rebuild
            }
        };

        tracing::debug!(
            "Session {} bound to '{}' {} ({:?})",
            session.id(),
            binding.identity,
            binding.version,
            applied
        );
        state.binding = Some(binding);
        applied
    }

    fn fresh(&self) -> History {
        History::fresh(self.defaults.system_prompt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedEngine;
    use crate::backend::{Engine, ProgressReporter};
    use crate::engine::{ResourceId, ResourceVersion};
    use crate::session::{Snapshot, TurnStatus};

    fn binding(identity: &str, version: ResourceVersion) -> ResourceBinding {
        ResourceBinding {
            identity: ResourceId::new(identity),
            version,
        }
    }

    async fn loaded(identity: &str, version: ResourceVersion) -> LoadedResource {
        let instance = ScriptedEngine::new()
            .load(&ResourceId::new(identity), ProgressReporter::silent())
            .await
            .unwrap();
        LoadedResource {
            identity: ResourceId::new(identity),
            version,
            instance,
        }
    }

    fn binder() -> SessionBinder {
        SessionBinder::new(
            Arc::new(SnapshotPolicy),
            SessionConfig {
                system_prompt: Some("You are terse.".to_string()),
            },
        )
    }

    #[test]
    fn test_decision_table() {
        let policy = SnapshotPolicy;
        let v1 = binding("m", ResourceVersion::STALE);
        let current = binding("m", ResourceVersion::new(2));

        assert_eq!(policy.resolve(None, &current, true), BindingAction::Rebuild);
        assert_eq!(policy.resolve(None, &current, false), BindingAction::Rebuild);
        assert_eq!(policy.resolve(Some(&current), &current, false), BindingAction::Reuse);
        assert_eq!(policy.resolve(Some(&v1), &current, true), BindingAction::Rehydrate);
        assert_eq!(policy.resolve(Some(&v1), &current, false), BindingAction::Rebuild);
    }

    #[tokio::test]
    async fn test_first_bind_seeds_defaults() {
        let session = Session::new("s");
        let resource = loaded("m", ResourceVersion::new(1)).await;

        assert_eq!(binder().bind(&session, &resource), BindingAction::Rebuild);
        assert_eq!(
            session.history().system_prompt.as_deref(),
            Some("You are terse.")
        );
        assert_eq!(session.binding(), Some(resource.binding()));
        assert_eq!(binder().bind(&session, &resource), BindingAction::Reuse);
    }

    #[tokio::test]
    async fn test_rehydrates_snapshot_under_new_version() {
        let old = loaded("a", ResourceVersion::new(1)).await;
        let new = loaded("b", ResourceVersion::new(2)).await;
        let session = Session::new("s");
        binder().bind(&session, &old);

        let mut expected = session.history();
        let idx = expected.push_prompt("q1");
        expected.resolve(idx, TurnStatus::Completed, Some("a1".to_string()));
        {
            let mut state = session.state();
            state.snapshot = Some(Snapshot {
                bytes: old.instance.serialize_history(&expected).unwrap(),
                identity: old.identity.clone(),
            });
            // In-memory history diverged; the snapshot wins
            state.history = History::default();
        }

        assert_eq!(binder().bind(&session, &new), BindingAction::Rehydrate);
        assert_eq!(session.history(), expected);
        assert_eq!(session.binding(), Some(new.binding()));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back_to_rebuild() {
        let old = loaded("a", ResourceVersion::new(1)).await;
        let new = loaded("b", ResourceVersion::new(2)).await;
        let session = Session::new("s");
        binder().bind(&session, &old);
        session.state().snapshot = Some(Snapshot {
            bytes: b"garbage".to_vec(),
            identity: old.identity.clone(),
        });

        assert_eq!(binder().bind(&session, &new), BindingAction::Rebuild);
        assert!(session.history().is_empty());
    }
}
