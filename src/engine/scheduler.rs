//! Request scheduler
//!
//! Owns the single resource handle and the two queues drawing on it:
//! - primary: user chat submissions
//! - background: summary titles, fed after a session's first completion
//!
//! Admission (binding, turn bookkeeping, enqueue) happens under the resource
//! gate. Generation happens outside it, one request per queue at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};

use super::binding::{BindingAction, BindingPolicy, SessionBinder, SnapshotPolicy};
use super::events::{Event, EventBus, HistoryChange};
use super::executor::Executor;
use super::queue::{Admission, RequestQueue, TurnSignal};
use super::request::{Request, RequestId, RequestKind, RequestResult, RequestStatus};
use super::resource::{LoadedResource, ResourceBinding, ResourceHandle, ResourceId, ResourceStatus};
use crate::backend::SharedEngine;
use crate::config::RelayrConfig;
use crate::error::SchedulerResult;
use crate::session::{Session, SessionId, Snapshot, TurnStatus};

/// Dual-queue scheduler over one engine resource
pub struct Scheduler {
    pub(super) resource: ResourceHandle,
    pub(super) primary: RequestQueue,
    pub(super) background: RequestQueue,
    pub(super) binder: SessionBinder,
    pub(super) executor: Executor,
    pub(super) events: EventBus,
    pub(super) config: RelayrConfig,
    next_request: AtomicU64,
}

/// A request that made it into a queue, with the resource it was bound to
pub(super) struct Admitted {
    pub request: Arc<Request>,
    pub turn: TurnSignal,
    pub resource: LoadedResource,
}

impl Scheduler {
    /// Create a scheduler with the snapshot binding policy
    pub fn new(engine: SharedEngine, config: RelayrConfig) -> Self {
        Self::with_binding_policy(engine, config, Arc::new(SnapshotPolicy))
    }

    pub fn with_binding_policy(
        engine: SharedEngine,
        config: RelayrConfig,
        policy: Arc<dyn BindingPolicy>,
    ) -> Self {
        let events = EventBus::new(config.scheduler.event_capacity);
        tracing::debug!(
            "Scheduler using engine '{}' (serialize_execution={})",
            engine.name(),
            config.scheduler.serialize_execution
        );
        Self {
            resource: ResourceHandle::new(engine, events.clone()),
            primary: RequestQueue::new("primary"),
            background: RequestQueue::new("background"),
            binder: SessionBinder::new(policy, config.session.clone()),
            executor: Executor::new(config.scheduler.serialize_execution),
            events,
            config,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayrConfig {
        &self.config
    }

    /// Resource state, identity and version
    pub fn status(&self) -> ResourceStatus {
        self.resource.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ResourceStatus> {
        self.resource.watch_status()
    }

    /// Queue of user submissions
    pub fn primary(&self) -> &RequestQueue {
        &self.primary
    }

    /// Queue of summary requests
    pub fn background(&self) -> &RequestQueue {
        &self.background
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Load `identity`, minting a new resource version. The load runs to
    /// the end even if this future is dropped.
    pub async fn load_resource(
        &self,
        identity: impl Into<ResourceId>,
    ) -> SchedulerResult<ResourceStatus> {
        self.resource.load(identity.into()).await?;
        Ok(self.resource.status())
    }

    /// Unload the current resource.
    ///
    /// Every outstanding request on both queues is cancelled and has
    /// resolved before the instance is released. The unload runs to the end
    /// even if this future is dropped.
    pub async fn unload_resource(self: &Arc<Self>) -> SchedulerResult<ResourceBinding> {
        let this = Arc::clone(self);
        self.resource
            .unload(move |binding| async move { this.drain(binding).await })
            .await
    }

    async fn drain(&self, binding: ResourceBinding) {
        let mut requests = self.primary.cancel_all();
        requests.extend(self.background.cancel_all());
        if requests.is_empty() {
            return;
        }

        tracing::info!(
            "Cancelling {} request(s) bound to '{}' {}",
            requests.len(),
            binding.identity,
            binding.version
        );
        join_all(requests.iter().map(|r| r.wait())).await;
    }

    /// Submit `prompt` on behalf of `session` and wait for its outcome.
    ///
    /// Resolves ResourceUnavailable without touching the session when no
    /// resource is loaded. The request keeps running if this future is
    /// dropped; use [`Scheduler::cancel`] to stop it.
    pub async fn submit(
        self: &Arc<Self>,
        session: &Arc<Session>,
        prompt: impl Into<String>,
    ) -> RequestResult {
        let Some((admitted, index)) = self.admit_chat(session, prompt.into()).await else {
            tracing::debug!("Session {} submitted with no resource loaded", session.id());
            return RequestResult::unavailable();
        };

        let request = Arc::clone(&admitted.request);
        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move { this.run_chat(session, admitted, index).await });

        request.wait().await
    }

    /// Cancel the outstanding requests of `session` on both queues.
    ///
    /// Returns false when the session had nothing outstanding. With
    /// `await_termination`, returns only after every cancelled request
    /// has resolved.
    pub async fn cancel(&self, session: &SessionId, await_termination: bool) -> bool {
        let cancelled: Vec<_> = [
            self.primary.cancel_by_session(session),
            self.background.cancel_by_session(session),
        ]
        .into_iter()
        .flatten()
        .collect();

        if cancelled.is_empty() {
            return false;
        }

        tracing::info!("Cancelled {} request(s) of session {}", cancelled.len(), session);
        if await_termination {
            join_all(cancelled.iter().map(|r| r.wait())).await;
        }
        true
    }

    pub(super) fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn emit_history(&self, session: &SessionId, change: HistoryChange) {
        self.events.emit(Event::SessionHistoryChanged {
            session: session.clone(),
            change,
        });
    }

    /// Bind, record the pending turn and enqueue, all under the gate so an
    /// unload either sees the request queued or admission sees Unloading.
    async fn admit_chat(&self, session: &Session, prompt: String) -> Option<(Admitted, usize)> {
        if !self.resource.status().is_loaded() {
            return None;
        }

        let slot = self.resource.enter().await;
        let resource = slot.loaded()?.clone();

        match self.binder.bind(session, &resource) {
            BindingAction::Reuse => {}
            BindingAction::Rehydrate => self.emit_history(session.id(), HistoryChange::Rehydrated),
            BindingAction::Rebuild => self.emit_history(session.id(), HistoryChange::Rebuilt),
        }

        let index = session.state().history.push_prompt(prompt);
        self.emit_history(session.id(), HistoryChange::TurnAdded { index });

        let request = Request::new(
            self.next_request_id(),
            session.id().clone(),
            RequestKind::Chat,
            self.config.scheduler.request_timeout(),
        );
        let turn = self.primary.enqueue(Arc::clone(&request));
        drop(slot);

        Some((
            Admitted {
                request,
                turn,
                resource,
            },
            index,
        ))
    }

    async fn run_chat(self: Arc<Self>, session: Arc<Session>, admitted: Admitted, index: usize) {
        let Admitted {
            request,
            mut turn,
            resource,
        } = admitted;
        let slot = QueueSlot::new(&self.primary, &request);

        let result = if wait_for_turn(&request, &mut turn).await {
            request.mark_running();
            self.executor
                .execute(
                    &resource,
                    session.history().up_to(index),
                    self.config.generation.clone(),
                    request.cancel_token(),
                )
                .await
        } else {
            RequestResult::cancelled()
        };

        if request.timed_out() {
            tracing::info!("Request {} of session {} timed out", request.id(), session.id());
        }

        let summarize = result.is_completed() && self.claim_summary(&session);
        self.record_turn(&session, &resource, index, &result);
        request.finish(result);
        drop(slot);

        if summarize {
            self.spawn_summary(session);
        }
    }

    /// Resolve the turn and refresh the snapshot if the session is still
    /// bound to the resource the request ran against
    fn record_turn(
        &self,
        session: &Session,
        resource: &LoadedResource,
        index: usize,
        result: &RequestResult,
    ) {
        let status = match result.status {
            RequestStatus::Completed => TurnStatus::Completed,
            RequestStatus::Cancelled => TurnStatus::Cancelled,
            RequestStatus::Failed | RequestStatus::ResourceUnavailable => TurnStatus::Failed,
        };

        let resolved = {
            let mut state = session.state();
            let resolved = state.history.resolve(index, status, result.completion.clone());
            if state.binding.as_ref() == Some(&resource.binding()) {
                match resource.instance.serialize_history(&state.history) {
                    Ok(bytes) => {
                        state.snapshot = Some(Snapshot {
                            bytes,
                            identity: resource.identity.clone(),
                        })
                    }
                    Err(e) => tracing::warn!(
                        "Could not snapshot session {}: {:#}",
                        session.id(),
                        e
                    ),
                }
            }
            resolved
        };

        if resolved {
            self.emit_history(session.id(), HistoryChange::TurnResolved { index, status });
        }
    }

    /// Mark the session as summarizing if it still needs a title
    fn claim_summary(&self, session: &Session) -> bool {
        if !self.config.summary.enabled {
            return false;
        }
        let mut state = session.state();
        if state.title.is_some() || state.summarizing {
            return false;
        }
        state.summarizing = true;
        true
    }
}

/// Wait until the request is admitted. False if it was cancelled or
/// withdrawn first.
pub(super) async fn wait_for_turn(request: &Request, turn: &mut TurnSignal) -> bool {
    let cancel = request.cancel_token();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        admission = turn.wait() => admission == Admission::Granted && !cancel.is_cancelled(),
    }
}

/// A request's place in its queue.
///
/// Dropping it removes the request, which admits the next one. If the
/// pipeline unwinds before resolving the request, it resolves as Failed.
pub(super) struct QueueSlot<'a> {
    queue: &'a RequestQueue,
    request: &'a Request,
}

impl<'a> QueueSlot<'a> {
    pub fn new(queue: &'a RequestQueue, request: &'a Request) -> Self {
        Self { queue, request }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.request.finish(RequestResult::failed("request pipeline aborted")) {
            tracing::warn!(
                "[{}] request {} aborted before resolving",
                self.queue.name(),
                self.request.id()
            );
        }
        self.queue.remove(self.request.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedEngine;
    use crate::engine::ResourceState;
    use crate::session::PersistedSession;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn config(summary: bool) -> RelayrConfig {
        let mut config = RelayrConfig::default();
        config.summary.enabled = summary;
        config.session.system_prompt = Some("sys".to_string());
        config
    }

    async fn loaded(engine: &ScriptedEngine, config: RelayrConfig) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler::new(Arc::new(engine.clone()), config));
        scheduler.load_resource("r1").await.unwrap();
        scheduler
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn spawn_submit(
        scheduler: &Arc<Scheduler>,
        session: &Arc<Session>,
        prompt: &str,
    ) -> tokio::task::JoinHandle<RequestResult> {
        let scheduler = Arc::clone(scheduler);
        let session = Arc::clone(session);
        let prompt = prompt.to_string();
        tokio::spawn(async move { scheduler.submit(&session, prompt).await })
    }

    fn statuses(session: &Session) -> Vec<TurnStatus> {
        session.history().turns.iter().map(|t| t.status).collect()
    }

    #[tokio::test]
    async fn test_submit_without_resource_is_unavailable() {
        let engine = ScriptedEngine::new();
        let scheduler = Arc::new(Scheduler::new(Arc::new(engine.clone()), config(false)));
        let session = Arc::new(Session::new("S1"));

        let result = scheduler.submit(&session, "Hello").await;

        assert_eq!(result.status, RequestStatus::ResourceUnavailable);
        assert!(session.history().is_empty());
        assert!(session.binding().is_none());
        assert!(engine.generate_calls().is_empty());
        assert!(scheduler.primary().is_empty());
    }

    #[tokio::test]
    async fn test_submit_completes_and_snapshots() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(false)).await;
        let session = Arc::new(Session::new("S1"));

        let result = scheduler.submit(&session, "Hello").await;

        assert_eq!(result.status, RequestStatus::Completed);
        assert_eq!(result.completion.as_deref(), Some("reply: Hello"));
        let history = session.history();
        assert_eq!(history.system_prompt.as_deref(), Some("sys"));
        assert_eq!(history.turns[0].response.as_deref(), Some("reply: Hello"));
        assert!(session.has_snapshot());
        assert!(scheduler.primary().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_order_with_single_flight() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let session = Arc::new(Session::new(format!("s{i}")));
            handles.push(spawn_submit(&scheduler, &session, &format!("q{i}")));
            wait_until(|| scheduler.primary().len() == i + 1).await;
        }

        assert_eq!(engine.next_started().await, "q0");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.generate_calls().len(), 1);
        let running = scheduler.primary().running().unwrap();
        assert_eq!(running.session().as_str(), "s0");

        engine.release(5);
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert_eq!(result.completion, Some(format!("reply: q{i}")));
        }

        let expected: Vec<String> = (0..5).map(|i| format!("q{i}")).collect();
        assert_eq!(engine.generate_calls(), expected);
        assert_eq!(engine.peak_concurrency(), 1);
        assert!(scheduler.primary().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_session_requests_answer_their_own_turns() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;
        let s0 = Arc::new(Session::new("S0"));
        let s1 = Arc::new(Session::new("S1"));

        let head = spawn_submit(&scheduler, &s0, "H");
        assert_eq!(engine.next_started().await, "H");
        let q1 = spawn_submit(&scheduler, &s1, "Q1");
        wait_until(|| scheduler.primary().len() == 2).await;
        let q2 = spawn_submit(&scheduler, &s1, "Q2");
        wait_until(|| scheduler.primary().len() == 3).await;

        engine.release(3);
        assert!(head.await.unwrap().is_completed());
        assert_eq!(q1.await.unwrap().completion.as_deref(), Some("reply: Q1"));
        assert_eq!(q2.await.unwrap().completion.as_deref(), Some("reply: Q2"));

        assert_eq!(engine.generate_calls(), vec!["H", "Q1", "Q2"]);
        let history = s1.history();
        assert_eq!(history.turns[0].response.as_deref(), Some("reply: Q1"));
        assert_eq!(history.turns[1].response.as_deref(), Some("reply: Q2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_takes_every_request_of_the_session() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;
        let s0 = Arc::new(Session::new("S0"));
        let s1 = Arc::new(Session::new("S1"));

        let head = spawn_submit(&scheduler, &s0, "H");
        assert_eq!(engine.next_started().await, "H");
        let q1 = spawn_submit(&scheduler, &s1, "Q1");
        wait_until(|| scheduler.primary().len() == 2).await;
        let q2 = spawn_submit(&scheduler, &s1, "Q2");
        wait_until(|| scheduler.primary().len() == 3).await;

        assert!(scheduler.cancel(s1.id(), true).await);
        assert_eq!(q1.await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(q2.await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(statuses(&s1), vec![TurnStatus::Cancelled, TurnStatus::Cancelled]);

        engine.release(1);
        assert!(head.await.unwrap().is_completed());
        assert_eq!(engine.generate_calls(), vec!["H"]);
    }

    #[tokio::test]
    async fn test_dropped_load_still_completes() {
        let engine = ScriptedEngine::new().slow_load(50);
        let scheduler = Arc::new(Scheduler::new(Arc::new(engine.clone()), config(false)));
        let mut events = scheduler.subscribe();

        let dropped = timeout(Duration::from_millis(5), scheduler.load_resource("r1")).await;
        assert!(dropped.is_err());

        wait_until(|| scheduler.status().is_loaded()).await;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            completed |= matches!(event, Event::ResourceLoadCompleted { .. });
        }
        assert!(completed);

        let s1 = Arc::new(Session::new("S1"));
        assert!(scheduler.submit(&s1, "Q1").await.is_completed());
        scheduler.unload_resource().await.unwrap();
        scheduler.load_resource("r2").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dropped_unload_still_drains() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));

        let first = spawn_submit(&scheduler, &s1, "Q1");
        assert_eq!(engine.next_started().await, "Q1");

        // Give up on the unload at its first await
        let _ = timeout(Duration::ZERO, scheduler.unload_resource()).await;

        wait_until(|| scheduler.status().state == ResourceState::Unloaded).await;
        assert_eq!(first.await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(statuses(&s1), vec![TurnStatus::Cancelled]);
        assert!(scheduler.primary().is_empty());

        scheduler.load_resource("r2").await.unwrap();
        assert!(scheduler.status().is_loaded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_running_awaits_resolution() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));

        let submit = spawn_submit(&scheduler, &s1, "Q1");
        assert_eq!(engine.next_started().await, "Q1");

        assert!(scheduler.cancel(s1.id(), true).await);
        // Turn is recorded before the completion future resolves
        assert_eq!(statuses(&s1), vec![TurnStatus::Cancelled]);

        let result = submit.await.unwrap();
        assert_eq!(result.status, RequestStatus::Cancelled);
        wait_until(|| scheduler.primary().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_waiting_never_reaches_engine() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));
        let s2 = Arc::new(Session::new("S2"));

        let first = spawn_submit(&scheduler, &s1, "Q1");
        assert_eq!(engine.next_started().await, "Q1");
        let second = spawn_submit(&scheduler, &s2, "Q2");
        wait_until(|| scheduler.primary().len() == 2).await;

        assert!(scheduler.cancel(s2.id(), true).await);
        assert_eq!(second.await.unwrap().status, RequestStatus::Cancelled);

        engine.release(1);
        assert_eq!(first.await.unwrap().status, RequestStatus::Completed);
        assert_eq!(engine.generate_calls(), vec!["Q1".to_string()]);
        assert_eq!(statuses(&s2), vec![TurnStatus::Cancelled]);
    }

    #[tokio::test]
    async fn test_cancel_with_nothing_outstanding() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(false)).await;
        assert!(!scheduler.cancel(&SessionId::new("nobody"), true).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unload_drains_every_request() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));
        let s2 = Arc::new(Session::new("S2"));
        let mut events = scheduler.subscribe();

        let first = spawn_submit(&scheduler, &s1, "Q1");
        assert_eq!(engine.next_started().await, "Q1");
        let second = spawn_submit(&scheduler, &s2, "Q2");
        wait_until(|| scheduler.primary().len() == 2).await;

        let binding = scheduler.unload_resource().await.unwrap();
        assert_eq!(binding.identity.as_str(), "r1");
        assert_eq!(scheduler.status().state, ResourceState::Unloaded);

        assert_eq!(first.await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(second.await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(engine.generate_calls(), vec!["Q1".to_string()]);

        let mut resolved = 0;
        loop {
            match events.recv().await.unwrap() {
                Event::SessionHistoryChanged {
                    change: HistoryChange::TurnResolved { status, .. },
                    ..
                } => {
                    assert_eq!(status, TurnStatus::Cancelled);
                    resolved += 1;
                }
                Event::ResourceUnloaded { identity } => {
                    assert_eq!(identity.as_str(), "r1");
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(resolved, 2);

        let late = scheduler.submit(&s1, "Q3").await;
        assert_eq!(late.status, RequestStatus::ResourceUnavailable);
        assert_eq!(s1.history().len(), 1);
    }

    #[tokio::test]
    async fn test_rehydrates_history_after_reload() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));
        let mut events = scheduler.subscribe();

        assert!(scheduler.submit(&s1, "Q1").await.is_completed());
        let before = s1.history();

        scheduler.unload_resource().await.unwrap();
        scheduler.load_resource("r2").await.unwrap();
        assert!(scheduler.submit(&s1, "Q2").await.is_completed());

        let after = s1.history();
        assert_eq!(after.system_prompt, before.system_prompt);
        assert_eq!(after.turns[0], before.turns[0]);
        assert_eq!(after.turns[1].response.as_deref(), Some("reply: Q2"));
        assert_eq!(engine.deserialize_count(), 1);
        assert_eq!(s1.binding().unwrap().identity.as_str(), "r2");

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::SessionHistoryChanged { change, .. } = event {
                changes.push(change);
            }
        }
        assert_eq!(changes[0], HistoryChange::Rebuilt);
        assert!(changes.contains(&HistoryChange::Rehydrated));
    }

    #[tokio::test]
    async fn test_reload_same_identity_is_new_version() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));

        scheduler.submit(&s1, "Q1").await;
        let first = s1.binding().unwrap();
        scheduler.unload_resource().await.unwrap();
        scheduler.load_resource("r1").await.unwrap();
        scheduler.submit(&s1, "Q2").await;

        let second = s1.binding().unwrap();
        assert_eq!(first.identity, second.identity);
        assert!(second.version > first.version);
        assert_eq!(engine.deserialize_count(), 1);
        assert_eq!(s1.history().len(), 2);
    }

    #[tokio::test]
    async fn test_restored_session_rehydrates() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(false)).await;
        let original = Arc::new(Session::new("S1"));
        scheduler.submit(&original, "Q1").await;

        let persisted: PersistedSession =
            serde_json::from_str(&serde_json::to_string(&original.persist()).unwrap()).unwrap();
        let restored = Arc::new(Session::restore(persisted));
        scheduler.submit(&restored, "Q2").await;

        let history = restored.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history.turns[0].prompt, "Q1");
        assert_eq!(engine.deserialize_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_cancelled() {
        let engine = ScriptedEngine::new().holding();
        let mut config = config(false);
        config.scheduler.request_timeout_ms = 50;
        let scheduler = loaded(&engine, config).await;
        let s1 = Arc::new(Session::new("S1"));

        let result = scheduler.submit(&s1, "slow").await;

        assert_eq!(result.status, RequestStatus::Cancelled);
        assert_eq!(statuses(&s1), vec![TurnStatus::Cancelled]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stall_the_queue() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(false)).await;
        let s1 = Arc::new(Session::new("S1"));

        let failed = scheduler.submit(&s1, "boom").await;
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(failed.error.unwrap().contains("engine exploded"));

        let panicked = scheduler.submit(&s1, "panic").await;
        assert_eq!(panicked.status, RequestStatus::Failed);

        assert!(scheduler.submit(&s1, "ok").await.is_completed());
        assert_eq!(
            statuses(&s1),
            vec![TurnStatus::Failed, TurnStatus::Failed, TurnStatus::Completed]
        );
        assert!(scheduler.primary().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_summary_sets_title_once() {
        let engine = ScriptedEngine::new();
        let scheduler = loaded(&engine, config(true)).await;
        let s1 = Arc::new(Session::new("S1"));
        let mut events = scheduler.subscribe();

        assert!(scheduler.submit(&s1, "Hello").await.is_completed());
        wait_until(|| s1.title().is_some()).await;
        let title = s1.title().unwrap();
        assert!(title.starts_with("reply: "));

        assert!(scheduler.submit(&s1, "Again").await.is_completed());
        sleep(Duration::from_millis(20)).await;
        let summaries = engine
            .generate_calls()
            .iter()
            .filter(|p| p.starts_with("User:"))
            .count();
        assert_eq!(summaries, 1);

        let mut saw_title = false;
        while let Ok(event) = events.try_recv() {
            if let Event::SessionHistoryChanged {
                change: HistoryChange::TitleChanged { title: t },
                ..
            } = event
            {
                assert_eq!(t, title);
                saw_title = true;
            }
        }
        assert!(saw_title);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_summary_and_chat_share_the_lane() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(true)).await;
        let s1 = Arc::new(Session::new("S1"));
        let s2 = Arc::new(Session::new("S2"));

        let first = spawn_submit(&scheduler, &s1, "Q1");
        assert_eq!(engine.next_started().await, "Q1");
        engine.release(1);
        assert!(first.await.unwrap().is_completed());

        let summary_prompt = engine.next_started().await;
        assert!(summary_prompt.starts_with("User: Q1"));

        let second = spawn_submit(&scheduler, &s2, "Q2");
        wait_until(|| scheduler.primary().len() == 1).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.generate_calls().len(), 2);

        engine.release(3);
        assert!(second.await.unwrap().is_completed());
        wait_until(|| s1.title().is_some()).await;
        assert_eq!(engine.peak_concurrency(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unload_cancels_background_summary() {
        let engine = ScriptedEngine::new().holding();
        let scheduler = loaded(&engine, config(true)).await;
        let s1 = Arc::new(Session::new("S1"));

        let first = spawn_submit(&scheduler, &s1, "Q1");
        assert_eq!(engine.next_started().await, "Q1");
        engine.release(1);
        assert!(first.await.unwrap().is_completed());
        engine.next_started().await;

        scheduler.unload_resource().await.unwrap();
        assert!(!s1.state().summarizing);
        wait_until(|| scheduler.background().is_empty()).await;
        assert!(s1.title().is_none());
    }
}
