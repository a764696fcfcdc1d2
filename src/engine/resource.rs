//! Resource handle
//!
//! Owns the lifecycle of the single loaded engine instance:
//! Unloaded -> Loading -> Loaded -> Unloading -> Unloaded.
//! Every transition happens while holding the resource gate.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::events::{Event, EventBus};
use super::gate::{ExclusiveGate, GateGuard};
use crate::backend::{EngineInstance, ProgressReporter, SharedEngine};
use crate::error::{SchedulerError, SchedulerResult};

/// Identity of a loadable model/configuration (a name, URI or path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Load counter. Each successful load mints a new version, even when the
/// same identity is loaded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Never assigned to a live resource
    pub const STALE: Self = Self(0);

    pub(crate) const fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The (identity, version) pair a session history is valid for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceBinding {
    pub identity: ResourceId,
    pub version: ResourceVersion,
}

/// Lifecycle state of the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Unloaded,
    Loading,
    Loaded,
    /// Draining in-flight requests before the instance is released
    Unloading,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Unloaded => "unloaded",
            ResourceState::Loading => "loading",
            ResourceState::Loaded => "loaded",
            ResourceState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// Observable snapshot of the handle, readable without the gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub state: ResourceState,
    pub identity: Option<ResourceId>,
    pub version: Option<ResourceVersion>,
}

impl ResourceStatus {
    fn unloaded() -> Self {
        Self {
            state: ResourceState::Unloaded,
            identity: None,
            version: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ResourceState::Loaded
    }
}

/// A live engine instance and the version it was loaded as
#[derive(Clone)]
pub struct LoadedResource {
    pub identity: ResourceId,
    pub version: ResourceVersion,
    pub instance: Arc<dyn EngineInstance>,
}

impl LoadedResource {
    pub fn binding(&self) -> ResourceBinding {
        ResourceBinding {
            identity: self.identity.clone(),
            version: self.version,
        }
    }
}

impl fmt::Debug for LoadedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedResource")
            .field("identity", &self.identity)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Gated resource state
#[derive(Debug)]
pub struct ResourceSlot {
    state: ResourceState,
    current: Option<LoadedResource>,
}

impl ResourceSlot {
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// The live resource, only while fully loaded
    pub fn loaded(&self) -> Option<&LoadedResource> {
        match self.state {
            ResourceState::Loaded => self.current.as_ref(),
            _ => None,
        }
    }
}

/// Owner of the shared engine instance.
///
/// Load and unload run on their own task, so a caller that stops waiting
/// (a dropped HTTP request) never leaves the slot stuck mid-transition.
pub struct ResourceHandle {
    shared: Arc<HandleShared>,
}

struct HandleShared {
    engine: SharedEngine,
    gate: ExclusiveGate<ResourceSlot>,
    status: watch::Sender<ResourceStatus>,
    versions: AtomicU64,
    events: EventBus,
}

impl ResourceHandle {
    pub fn new(engine: SharedEngine, events: EventBus) -> Self {
        let (status, _) = watch::channel(ResourceStatus::unloaded());
        Self {
            shared: Arc::new(HandleShared {
                engine,
                gate: ExclusiveGate::new(
                    "resource",
                    ResourceSlot {
                        state: ResourceState::Unloaded,
                        current: None,
                    },
                ),
                status,
                versions: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Current status without taking the gate
    pub fn status(&self) -> ResourceStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ResourceStatus> {
        self.shared.status.subscribe()
    }

    /// Take the resource gate
    pub async fn enter(&self) -> GateGuard<'_, ResourceSlot> {
        self.shared.gate.enter().await
    }

    /// Load `identity` into a new engine instance.
    ///
    /// Rejects with [`SchedulerError::ResourceBusy`] unless the handle is
    /// Unloaded. A failed load leaves the handle Unloaded and is not retried.
    /// Dropping the returned future does not abort the load.
    pub async fn load(&self, identity: ResourceId) -> SchedulerResult<LoadedResource> {
        if identity.as_str().trim().is_empty() {
            return Err(SchedulerError::InvalidIdentity(identity.to_string()));
        }
        self.shared.ensure_state(ResourceState::Unloaded)?;

        let shared = Arc::clone(&self.shared);
        self.join(tokio::spawn(async move { shared.load(identity).await }))
            .await
    }

    /// Unload the current resource.
    ///
    /// `drain` runs under the gate after the handle enters Unloading and must
    /// not return until every request bound to the resource has terminated.
    /// Only then is the instance released. Dropping the returned future does
    /// not abort the unload.
    pub async fn unload<F, Fut>(&self, drain: F) -> SchedulerResult<ResourceBinding>
    where
        F: FnOnce(ResourceBinding) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.ensure_state(ResourceState::Loaded)?;

        let shared = Arc::clone(&self.shared);
        self.join(tokio::spawn(async move { shared.unload(drain).await }))
            .await
    }

    async fn join<T>(&self, task: JoinHandle<SchedulerResult<T>>) -> SchedulerResult<T> {
        match task.await {
            Ok(result) => result,
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(_) => Err(SchedulerError::ResourceBusy {
                    state: self.status().state,
                }),
            },
        }
    }
}

impl HandleShared {
    async fn load(&self, identity: ResourceId) -> SchedulerResult<LoadedResource> {
        let mut slot = self.gate.enter().await;
        if slot.state != ResourceState::Unloaded {
            return Err(SchedulerError::ResourceBusy { state: slot.state });
        }

        slot.state = ResourceState::Loading;
        self.publish(ResourceState::Loading, Some(identity.clone()), None);
        tracing::info!("Loading resource '{}' with {} engine", identity, self.engine.name());

        let events = self.events.clone();
        let progress_id = identity.clone();
        let progress = ProgressReporter::new(move |fraction| {
            events.emit(Event::ResourceLoadProgress {
                identity: progress_id.clone(),
                fraction,
            })
        });

        // Run on its own task so a panicking engine cannot wedge the slot in Loading
        let engine = Arc::clone(&self.engine);
        let load_id = identity.clone();
        let outcome = tokio::spawn(async move { engine.load(&load_id, progress).await }).await;

        let instance = match outcome {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => return Err(self.fail_load(&mut slot, identity, format!("{e:#}"))),
            Err(e) => return Err(self.fail_load(&mut slot, identity, format!("engine task failed: {e}"))),
        };

        let version = ResourceVersion::new(self.versions.fetch_add(1, Ordering::SeqCst) + 1);
        let loaded = LoadedResource {
            identity: identity.clone(),
            version,
            instance,
        };
        slot.current = Some(loaded.clone());
        slot.state = ResourceState::Loaded;
        self.publish(ResourceState::Loaded, Some(identity.clone()), Some(version));

        tracing::info!("Resource '{}' loaded as {}", identity, version);
        self.events
            .emit(Event::ResourceLoadCompleted { identity, version });
        Ok(loaded)
    }

    async fn unload<F, Fut>(&self, drain: F) -> SchedulerResult<ResourceBinding>
    where
        F: FnOnce(ResourceBinding) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut slot = self.gate.enter().await;
        let binding = match (slot.state, slot.current.as_ref()) {
            (ResourceState::Loaded, Some(current)) => current.binding(),
            (ResourceState::Unloaded, _) => return Err(SchedulerError::NotLoaded),
            (state, _) => return Err(SchedulerError::ResourceBusy { state }),
        };

        slot.state = ResourceState::Unloading;
        self.publish(
            ResourceState::Unloading,
            Some(binding.identity.clone()),
            Some(binding.version),
        );
        tracing::info!("Unloading resource '{}' ({})", binding.identity, binding.version);

        drain(binding.clone()).await;

        slot.current = None;
        slot.state = ResourceState::Unloaded;
        self.publish(ResourceState::Unloaded, None, None);

        tracing::info!("Resource '{}' unloaded", binding.identity);
        self.events.emit(Event::ResourceUnloaded {
            identity: binding.identity.clone(),
        });
        Ok(binding)
    }

    fn ensure_state(&self, expected: ResourceState) -> SchedulerResult<()> {
        match self.status.borrow().state {
            state if state == expected => Ok(()),
            ResourceState::Unloaded => Err(SchedulerError::NotLoaded),
            state => Err(SchedulerError::ResourceBusy { state }),
        }
    }

    fn fail_load(
        &self,
        slot: &mut ResourceSlot,
        identity: ResourceId,
        message: String,
    ) -> SchedulerError {
        slot.current = None;
        slot.state = ResourceState::Unloaded;
        self.publish(ResourceState::Unloaded, None, None);

        tracing::warn!("Failed to load resource '{}': {}", identity, message);
        self.events.emit(Event::ResourceLoadFailed {
            identity: identity.clone(),
            error: message.clone(),
        });
        SchedulerError::LoadFailed {
            identity: identity.to_string(),
            message,
        }
    }

    fn publish(
        &self,
        state: ResourceState,
        identity: Option<ResourceId>,
        version: Option<ResourceVersion>,
    ) {
        self.status.send_replace(ResourceStatus {
            state,
            identity,
            version,
        });
    }
}
