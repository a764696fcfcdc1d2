//! Background summary titles
//!
//! After a session's first completed chat turn, a summary request goes on the
//! background queue. It asks the engine for a short title over a scratch
//! history and never touches the session's own history. Failures are logged.

use std::sync::Arc;

use super::events::HistoryChange;
use super::request::{Request, RequestKind, RequestResult};
use super::scheduler::{wait_for_turn, Admitted, QueueSlot, Scheduler};
use crate::config::{GenerationConfig, SummaryConfig};
use crate::session::{History, Session};

impl Scheduler {
    pub(super) fn spawn_summary(self: &Arc<Self>, session: Arc<Session>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_summary(session).await });
    }

    async fn run_summary(&self, session: Arc<Session>) {
        let Some(admitted) = self.admit_summary(&session).await else {
            session.state().summarizing = false;
            tracing::debug!("Skipping summary for session {}: no resource loaded", session.id());
            return;
        };

        let Admitted {
            request,
            mut turn,
            resource,
        } = admitted;
        let slot = QueueSlot::new(&self.background, &request);

        let result = if wait_for_turn(&request, &mut turn).await {
            request.mark_running();
            let scratch = summary_history(&session.history(), &self.config.summary);
            let config = GenerationConfig::greedy().with_max_tokens(self.config.summary.max_tokens);
            self.executor
                .execute(&resource, scratch, config, request.cancel_token())
                .await
        } else {
            RequestResult::cancelled()
        };

        let title = result
            .completion
            .as_deref()
            .and_then(|text| extract_title(text, self.config.summary.max_title_chars));
        {
            let mut state = session.state();
            state.summarizing = false;
            if let Some(title) = &title {
                state.title = Some(title.clone());
            }
        }

        match &title {
            Some(title) => {
                tracing::debug!("Session {} titled {:?}", session.id(), title);
                self.emit_history(
                    session.id(),
                    HistoryChange::TitleChanged {
                        title: title.clone(),
                    },
                );
            }
            None => {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| result.status.to_string());
                tracing::debug!("Summary for session {} produced no title ({})", session.id(), reason);
            }
        }

        request.finish(result);
        drop(slot);
    }

    async fn admit_summary(&self, session: &Session) -> Option<Admitted> {
        if !self.resource.status().is_loaded() {
            return None;
        }

        let slot = self.resource.enter().await;
        let resource = slot.loaded()?.clone();
        let request = Request::new(
            self.next_request_id(),
            session.id().clone(),
            RequestKind::Summary,
            self.config.summary.timeout(),
        );
        let turn = self.background.enqueue(Arc::clone(&request));
        drop(slot);

        Some(Admitted {
            request,
            turn,
            resource,
        })
    }
}

/// Scratch history: the instruction as system prompt, the completed
/// conversation as the single pending prompt
fn summary_history(history: &History, config: &SummaryConfig) -> History {
    let mut transcript = String::new();
    for turn in history.completed() {
        transcript.push_str(&format!("User: {}\n", turn.prompt));
        if let Some(response) = &turn.response {
            transcript.push_str(&format!("Assistant: {}\n", response));
        }
    }

    let mut scratch = History::fresh(Some(config.instruction.clone()));
    scratch.push_prompt(transcript.trim_end().to_string());
    scratch
}

/// First non-empty line, stripped of quoting and markdown emphasis
fn extract_title(text: &str, max_chars: usize) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '#' | '*' | '`'))
        .trim();
    if line.is_empty() || max_chars == 0 {
        return None;
    }

    let title: String = line.chars().take(max_chars).collect();
    Some(title.trim_end().to_string())
}
