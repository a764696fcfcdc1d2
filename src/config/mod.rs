//! Configuration system for relayr
//!
//! One `RelayrConfig` file (YAML or JSON) covers sampling defaults, queue
//! behaviour, session seeding, background summaries, the built-in echo
//! engine and the HTTP server. Every field has a default.

mod generation;
mod scheduler;
mod server;

pub use generation::GenerationConfig;
pub use scheduler::{SchedulerConfig, SessionConfig, SummaryConfig};
pub use server::ServerConfig;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::EchoConfig;

/// relayr configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayrConfig {
    /// Sampling settings for chat requests
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Queue and execution settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Defaults for fresh session histories
    #[serde(default)]
    pub session: SessionConfig,

    /// Background summary-title generation
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Built-in echo engine latencies
    #[serde(default)]
    pub echo: EchoConfig,

    /// Server settings (only for `relayr serve`)
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

impl RelayrConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load by extension: `.json` as JSON, anything else as YAML
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path),
            _ => Self::from_yaml(path),
        }
    }

    /// Server settings, falling back to defaults
    pub fn server_or_default(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }
}
