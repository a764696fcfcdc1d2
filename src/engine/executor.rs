//! Request executor
//!
//! Runs one admitted request against the loaded resource and classifies the
//! outcome. Generation happens outside the resource gate. Calls from both
//! scheduler queues meet in a shared execution lane unless the instance is
//! reentrant and serialization is switched off.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::request::RequestResult;
use super::resource::LoadedResource;
use crate::config::GenerationConfig;
use crate::session::History;

/// Runs generation calls for both scheduler queues
pub struct Executor {
    lane: Arc<Mutex<()>>,
    serialize_execution: bool,
}

impl Executor {
    pub fn new(serialize_execution: bool) -> Self {
        Self {
            lane: Arc::new(Mutex::new(())),
            serialize_execution,
        }
    }

    /// Generate against `resource` and classify the result.
    ///
    /// A cancelled token always resolves as Cancelled. Engine errors and
    /// panics resolve as Failed.
    pub async fn execute(
        &self,
        resource: &LoadedResource,
        history: History,
        config: GenerationConfig,
        cancel: CancellationToken,
    ) -> RequestResult {
        let needs_lane = self.serialize_execution || !resource.instance.is_reentrant();
        let _lane = if needs_lane {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RequestResult::cancelled(),
                guard = self.lane.lock() => Some(guard),
            }
        } else {
            None
        };

        if cancel.is_cancelled() {
            return RequestResult::cancelled();
        }

        let instance = Arc::clone(&resource.instance);
        let token = cancel.clone();
        let outcome =
            tokio::spawn(async move { instance.generate(&history, &config, token).await }).await;

        classify(outcome, &cancel)
    }
}

fn classify(
    outcome: Result<anyhow::Result<String>, JoinError>,
    cancel: &CancellationToken,
) -> RequestResult {
    if cancel.is_cancelled() {
        return RequestResult::cancelled();
    }
    match outcome {
        Ok(Ok(text)) => RequestResult::completed(text),
        Ok(Err(e)) => RequestResult::failed(format!("{e:#}")),
        Err(e) if e.is_panic() => {
            tracing::error!("Engine panicked during generation");
            RequestResult::failed("engine panicked during generation")
        }
        Err(e) => RequestResult::failed(format!("generation task aborted: {e}")),
    }
}
