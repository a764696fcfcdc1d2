//! CLI commands
//!
//! `run` chats interactively against the built-in echo engine, `serve`
//! exposes the scheduler over HTTP.

mod run;
mod serve;

pub use run::run;
pub use serve::serve;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::RelayrConfig;

/// relayr - single-resource request scheduler for conversational engines
#[derive(Parser)]
#[command(name = "relayr")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat interactively with a resource
    Run {
        /// Resource identity to load
        model: String,

        /// Optional single prompt; exits after the reply
        #[arg(long, short)]
        prompt: Option<String>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,

        /// System prompt for fresh histories
        #[arg(long)]
        system: Option<String>,

        /// Configuration file (YAML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Start the HTTP server
    Serve {
        /// Resource identity to load at startup (optional, can load via API)
        #[arg(long, short)]
        model: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Configuration file (YAML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Load the configuration file, or defaults when none is given
pub fn load_config(path: Option<&Path>) -> Result<RelayrConfig> {
    match path {
        Some(path) => {
            tracing::debug!("Loading config from {}", path.display());
            RelayrConfig::from_path(path)
        }
        None => Ok(RelayrConfig::default()),
    }
}
