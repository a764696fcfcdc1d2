//! Scripted engine for scheduler tests
//!
//! Prompt conventions: `"boom"` fails, `"panic"` panics, anything else
//! replies `"reply: <prompt>"`. When holding, every generate call blocks
//! until [`ScriptedEngine::release`] hands out a permit or it is cancelled.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{Engine, EngineInstance, ProgressReporter};
use crate::config::GenerationConfig;
use crate::engine::ResourceId;
use crate::session::History;

struct Shared {
    hold: AtomicBool,
    release: Semaphore,
    fail_next_load: AtomicBool,
    load_delay_ms: AtomicU64,
    reentrant: AtomicBool,
    active: AtomicUsize,
    peak: AtomicUsize,
    generate_calls: Mutex<Vec<String>>,
    loads: Mutex<Vec<String>>,
    deserialized: AtomicUsize,
    started_tx: mpsc::UnboundedSender<String>,
    started_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

#[derive(Clone)]
pub(crate) struct ScriptedEngine {
    shared: Arc<Shared>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                hold: AtomicBool::new(false),
                release: Semaphore::new(0),
                fail_next_load: AtomicBool::new(false),
                load_delay_ms: AtomicU64::new(0),
                reentrant: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                generate_calls: Mutex::new(Vec::new()),
                loads: Mutex::new(Vec::new()),
                deserialized: AtomicUsize::new(0),
                started_tx,
                started_rx: tokio::sync::Mutex::new(started_rx),
            }),
        }
    }

    /// Block generate calls until released
    pub fn holding(self) -> Self {
        self.shared.hold.store(true, Ordering::SeqCst);
        self
    }

    pub fn reentrant(self) -> Self {
        self.shared.reentrant.store(true, Ordering::SeqCst);
        self
    }

    /// Make every load take `ms` milliseconds
    pub fn slow_load(self, ms: u64) -> Self {
        self.shared.load_delay_ms.store(ms, Ordering::SeqCst);
        self
    }

    pub fn fail_next_load(&self) {
        self.shared.fail_next_load.store(true, Ordering::SeqCst);
    }

    /// Let `n` held generate calls finish
    pub fn release(&self, n: usize) {
        self.shared.release.add_permits(n);
    }

    /// Wait until the next generate call starts and return its prompt
    pub async fn next_started(&self) -> String {
        let mut rx = self.shared.started_rx.lock().await;
        rx.recv().await.unwrap_or_default()
    }

    /// Prompts in the order generate was entered
    pub fn generate_calls(&self) -> Vec<String> {
        self.shared.generate_calls.lock().clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.shared.loads.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    pub fn deserialize_count(&self) -> usize {
        self.shared.deserialized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(
        &self,
        identity: &ResourceId,
        progress: ProgressReporter,
    ) -> Result<Arc<dyn EngineInstance>> {
        self.shared.loads.lock().push(identity.to_string());
        progress.report(0.5);
        let delay = self.shared.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.shared.fail_next_load.swap(false, Ordering::SeqCst) {
            bail!("weights for '{}' are corrupt", identity);
        }
        progress.report(1.0);
        Ok(Arc::new(ScriptedInstance {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedInstance {
    shared: Arc<Shared>,
}

struct ActiveGuard<'a>(&'a Shared);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineInstance for ScriptedInstance {
    async fn generate(
        &self,
        history: &History,
        _config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<String> {
        let prompt = history
            .last()
            .map(|t| t.prompt.clone())
            .ok_or_else(|| anyhow!("empty history"))?;

        let now = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.shared);
        self.shared.peak.fetch_max(now, Ordering::SeqCst);
        self.shared.generate_calls.lock().push(prompt.clone());
        let _ = self.shared.started_tx.send(prompt.clone());

        if self.shared.hold.load(Ordering::SeqCst) {
            tokio::select! {
                permit = self.shared.release.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => bail!("generation cancelled"),
            }
        } else {
            tokio::task::yield_now().await;
        }

        match prompt.as_str() {
            "boom" => Err(anyhow!("engine exploded")),
            "panic" => panic!("engine panicked"),
            _ => Ok(format!("reply: {}", prompt)),
        }
    }

    fn serialize_history(&self, history: &History) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(history)?)
    }

    fn deserialize_history(&self, bytes: &[u8]) -> Result<History> {
        self.shared.deserialized.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_slice(bytes)?)
    }

    fn is_reentrant(&self) -> bool {
        self.shared.reentrant.load(Ordering::SeqCst)
    }
}
