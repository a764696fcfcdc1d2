//! Scheduling core
//!
//! This module coordinates access to one engine resource:
//! - Resource: lifecycle of the loaded instance (load/unload, versions)
//! - Gate: exclusive section around lifecycle transitions and admission
//! - Queue: FIFO, single-flight request queues
//! - Binding: reconciles a session's history with the loaded resource
//! - Executor: runs admitted requests and classifies their outcome
//! - Scheduler: the public surface over all of the above

mod binding;
mod events;
mod executor;
mod gate;
mod queue;
mod request;
mod resource;
mod scheduler;
mod summary;

pub use binding::{BindingAction, BindingPolicy, SessionBinder, SnapshotPolicy};
pub use events::{Event, EventBus, HistoryChange};
pub use executor::Executor;
pub use gate::{ExclusiveGate, GateGuard};
pub use queue::{Admission, RequestQueue, TurnSignal};
pub use request::{Request, RequestId, RequestKind, RequestResult, RequestState, RequestStatus};
pub use resource::{
    LoadedResource, ResourceBinding, ResourceHandle, ResourceId, ResourceSlot, ResourceState,
    ResourceStatus, ResourceVersion,
};
pub use scheduler::Scheduler;
