//! relayr - single-resource request scheduler for conversational engines
//!
//! relayr mediates between many conversational sessions and one expensive,
//! exclusively held engine resource (a loaded model, a GPU context).
//!
//! # Architecture
//!
//! - **backend**: the engine collaborator traits and a built-in echo engine
//! - **engine**: resource lifecycle, FIFO queues, session binding, scheduler
//! - **session**: sessions, histories and persisted snapshots
//! - **server** / **cli**: HTTP and interactive surfaces over the scheduler
//!
//! Requests run one at a time per queue in strict arrival order. Loading a
//! different resource never silently corrupts a session: its history is
//! reused, rehydrated from a snapshot, or rebuilt.
//!
//! # Example
//!
//! ```bash
//! # Interactive chat
//! relayr run echo-small --prompt "Hello"
//!
//! # Start server
//! relayr serve --model echo-small --port 8080
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod session;

// Re-export key types
pub use backend::{EchoEngine, Engine, EngineInstance};
pub use config::{GenerationConfig, RelayrConfig, ServerConfig};
pub use engine::{RequestResult, RequestStatus, ResourceState, Scheduler};
pub use error::{SchedulerError, SchedulerResult};
pub use session::{History, PersistedSession, Session, SessionId};
