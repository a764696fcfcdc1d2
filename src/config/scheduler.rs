//! Scheduler, session and summary settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Queue and execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Deadline for a chat request, from submission (0 = none)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Buffered events per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Serialize generation across the chat and summary queues.
    /// Only a reentrant engine instance may run unserialized.
    #[serde(default = "default_true")]
    pub serialize_execution: bool,
}

fn default_request_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_event_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            event_capacity: default_event_capacity(),
            serialize_execution: true,
        }
    }
}

impl SchedulerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        timeout(self.request_timeout_ms)
    }
}

/// Defaults seeding a rebuilt session history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// System prompt placed at the start of every fresh history
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Background summary-title generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Generate a title after a session's first completed turn
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deadline for a summary request (0 = none)
    #[serde(default = "default_summary_timeout_ms")]
    pub timeout_ms: u64,

    /// Token budget for the title
    #[serde(default = "default_summary_max_tokens")]
    pub max_tokens: usize,

    /// Instruction used as the system prompt of the summary request
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Titles are truncated to this many characters
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
}

fn default_summary_timeout_ms() -> u64 {
    60_000
}

fn default_summary_max_tokens() -> usize {
    16
}

fn default_instruction() -> String {
    "Summarize the conversation below as a short title. Reply with the title only.".to_string()
}

fn default_max_title_chars() -> usize {
    48
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_summary_timeout_ms(),
            max_tokens: default_summary_max_tokens(),
            instruction: default_instruction(),
            max_title_chars: default_max_title_chars(),
        }
    }
}

impl SummaryConfig {
    pub fn timeout(&self) -> Option<Duration> {
        timeout(self.timeout_ms)
    }
}

fn timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
