//! Deterministic echo engine
//!
//! Replies by echoing the pending prompt word by word. Useful for exercising
//! the scheduler end to end without model weights.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Engine, EngineInstance, ProgressReporter};
use crate::config::GenerationConfig;
use crate::engine::ResourceId;
use crate::session::{History, TurnStatus};

/// Snapshot format tag written by [`EchoEngine`] instances
const SNAPSHOT_FORMAT: &str = "relayr-echo/1";

/// Simulated latencies for the echo engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    /// Number of progress steps reported while loading
    #[serde(default = "default_load_steps")]
    pub load_steps: usize,

    /// Delay between load progress steps in milliseconds
    #[serde(default)]
    pub load_step_ms: u64,

    /// Delay between emitted words in milliseconds
    #[serde(default)]
    pub token_ms: u64,
}

fn default_load_steps() -> usize {
    4
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            load_steps: default_load_steps(),
            load_step_ms: 0,
            token_ms: 0,
        }
    }
}

/// Echo engine loader
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    config: EchoConfig,
}

impl EchoEngine {
    pub fn new(config: EchoConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Engine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    async fn load(
        &self,
        identity: &ResourceId,
        progress: ProgressReporter,
    ) -> Result<Arc<dyn EngineInstance>> {
        if identity.as_str().trim().is_empty() {
            bail!("echo engine cannot load an empty identity");
        }

        let steps = self.config.load_steps.max(1);
        for step in 1..=steps {
            if self.config.load_step_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.load_step_ms)).await;
            }
            progress.report(step as f32 / steps as f32);
        }

        Ok(Arc::new(EchoInstance {
            identity: identity.clone(),
            token_delay: Duration::from_millis(self.config.token_ms),
        }))
    }
}

struct EchoInstance {
    identity: ResourceId,
    token_delay: Duration,
}

#[derive(Serialize, Deserialize)]
struct EchoSnapshot {
    format: String,
    identity: String,
    history: History,
}

#[async_trait]
impl EngineInstance for EchoInstance {
    async fn generate(
        &self,
        history: &History,
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<String> {
        let prompt = match history.last() {
            Some(turn) if turn.status == TurnStatus::Pending => turn.prompt.as_str(),
            _ => bail!("history has no pending turn"),
        };

        let mut words = Vec::new();
        for word in prompt.split_whitespace().take(config.max_tokens) {
            if config.stop_sequences.iter().any(|s| word.contains(s.as_str())) {
                break;
            }
            if cancel.is_cancelled() {
                bail!("generation cancelled");
            }
            if !self.token_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => bail!("generation cancelled"),
                    _ = tokio::time::sleep(self.token_delay) => {}
                }
            }
            words.push(word);
        }

        Ok(words.join(" "))
    }

    fn serialize_history(&self, history: &History) -> Result<Vec<u8>> {
        let snapshot = EchoSnapshot {
            format: SNAPSHOT_FORMAT.to_string(),
            identity: self.identity.to_string(),
            history: history.clone(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn deserialize_history(&self, bytes: &[u8]) -> Result<History> {
        let snapshot: EchoSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(anyhow!("unsupported snapshot format: {}", snapshot.format));
        }
        tracing::debug!(
            "Rehydrating history taken under '{}' into '{}'",
            snapshot.identity,
            self.identity
        );
        Ok(snapshot.history)
    }
}
