//! Error types for resource lifecycle operations
//!
//! Request outcomes are not errors: `submit` always resolves to a
//! [`RequestResult`](crate::engine::RequestResult) whose status carries the
//! Cancelled / Failed / ResourceUnavailable classification.

use thiserror::Error;

use crate::engine::ResourceState;

/// Error type for resource load/unload operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Another lifecycle transition owns the resource
    #[error("Resource is busy: currently {state}")]
    ResourceBusy {
        /// State observed when the operation was rejected
        state: ResourceState,
    },

    /// Unload requested while nothing is loaded
    #[error("No resource is loaded")]
    NotLoaded,

    /// The engine failed to load the requested identity
    #[error("Failed to load resource '{identity}': {message}")]
    LoadFailed {
        /// Identity that was being loaded
        identity: String,
        /// Engine error, stringified
        message: String,
    },

    /// Identity was empty or otherwise unusable
    #[error("Invalid resource identity: {0:?}")]
    InvalidIdentity(String),
}

/// Result alias for scheduler operations
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
