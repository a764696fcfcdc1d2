//! Conversation history

use serde::{Deserialize, Serialize};

/// Terminal (or pending) status of a single turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Admitted but not yet resolved
    Pending,
    /// The engine produced a response
    Completed,
    /// Cancelled explicitly or by timeout
    Cancelled,
    /// The engine reported an error
    Failed,
}

/// One prompt/response exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub prompt: String,
    #[serde(default)]
    pub response: Option<String>,
    pub status: TurnStatus,
}

/// Ordered sequence of turns plus the system prompt that seeded it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl History {
    /// Create an empty history seeded with an optional system prompt
    pub fn fresh(system_prompt: Option<String>) -> Self {
        Self {
            system_prompt,
            turns: Vec::new(),
        }
    }

    /// Append a pending turn and return its index
    pub fn push_prompt(&mut self, prompt: impl Into<String>) -> usize {
        self.turns.push(Turn {
            prompt: prompt.into(),
            response: None,
            status: TurnStatus::Pending,
        });
        self.turns.len() - 1
    }

    /// Resolve a pending turn. Returns false if the index is unknown or
    /// the turn was already resolved.
    pub fn resolve(&mut self, index: usize, status: TurnStatus, response: Option<String>) -> bool {
        match self.turns.get_mut(index) {
            Some(turn) if turn.status == TurnStatus::Pending => {
                turn.status = status;
                turn.response = response;
                true
            }
            _ => false,
        }
    }

    /// Copy ending at turn `index`, so that turn is the last one
    pub fn up_to(&self, index: usize) -> History {
        let end = (index + 1).min(self.turns.len());
        History {
            system_prompt: self.system_prompt.clone(),
            turns: self.turns[..end].to_vec(),
        }
    }

    /// Turns that produced a response, in order
    pub fn completed(&self) -> impl Iterator<Item = &Turn> {
        self.turns
            .iter()
            .filter(|t| t.status == TurnStatus::Completed)
    }

    /// The most recent turn, if any
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
