//! Inference engine collaborator
//!
//! relayr never generates tokens itself. It drives an external engine
//! through these traits:
//! - [`Engine`]: loads an identity into a live [`EngineInstance`]
//! - [`EngineInstance`]: generates against a history and (de)serializes
//!   histories into opaque snapshots
//!
//! [`EchoEngine`] is a deterministic implementation used by the CLI and the
//! HTTP server when no real engine is wired in.

mod echo;
#[cfg(test)]
pub(crate) mod testing;

pub use echo::{EchoConfig, EchoEngine};

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::engine::ResourceId;
use crate::session::History;

/// Fractional load progress callback handed to [`Engine::load`]
pub struct ProgressReporter {
    report: Box<dyn Fn(f32) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new<F>(report: F) -> Self
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        Self {
            report: Box::new(report),
        }
    }

    /// Reporter that drops every update
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    /// Report progress in `[0.0, 1.0]`. Out-of-range values are clamped.
    pub fn report(&self, fraction: f32) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        (self.report)(fraction);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Loader side of the external engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Load `identity` into a new live instance
    async fn load(
        &self,
        identity: &ResourceId,
        progress: ProgressReporter,
    ) -> Result<Arc<dyn EngineInstance>>;
}

/// A live, loaded engine instance
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Generate a completion for the last (pending) turn of `history`.
    ///
    /// Implementations should return promptly once `cancel` fires.
    async fn generate(
        &self,
        history: &History,
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<String>;

    /// Serialize a history into an opaque snapshot
    fn serialize_history(&self, history: &History) -> Result<Vec<u8>>;

    /// Rebuild a history from a snapshot taken by this or an earlier instance
    fn deserialize_history(&self, bytes: &[u8]) -> Result<History>;

    /// Whether concurrent `generate` calls on this instance are safe
    fn is_reentrant(&self) -> bool {
        false
    }
}

/// Boxed engine type held by the scheduler
pub type SharedEngine = Arc<dyn Engine>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_reporter_clamps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter = ProgressReporter::new(move |f| sink.lock().unwrap().push(f));

        reporter.report(-1.0);
        reporter.report(0.5);
        reporter.report(3.0);
        reporter.report(f32::NAN);

        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.5, 1.0, 0.0]);
    }
}
