//! FIFO request queue
//!
//! Strict arrival order, single flight: the head of the queue is the only
//! Running request. Removing the head admits the next one.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::request::{Request, RequestId, RequestResult};
use crate::session::SessionId;

/// Answer delivered on a request's wait-for-turn signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request is now the head and may run
    Granted,
    /// The request was removed before it became the head
    Withdrawn,
}

/// Wait-for-turn signal handed out by [`RequestQueue::enqueue`]
#[derive(Debug)]
pub struct TurnSignal {
    rx: oneshot::Receiver<Admission>,
}

impl TurnSignal {
    /// Wait for the queue's answer
    pub async fn wait(&mut self) -> Admission {
        (&mut self.rx).await.unwrap_or(Admission::Withdrawn)
    }

    /// Non-blocking check; `None` while still waiting
    pub fn try_admission(&mut self) -> Option<Admission> {
        match self.rx.try_recv() {
            Ok(admission) => Some(admission),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Admission::Withdrawn),
        }
    }
}

struct Entry {
    request: Arc<Request>,
    turn: Option<oneshot::Sender<Admission>>,
}

impl Entry {
    fn signal(&mut self, admission: Admission) {
        if let Some(tx) = self.turn.take() {
            let _ = tx.send(admission);
        }
    }
}

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<Entry>,
    running: Option<RequestId>,
}

impl QueueInner {
    /// Point `running` at the head and raise its signal
    fn admit_head(&mut self) {
        self.running = None;
        if let Some(head) = self.entries.front_mut() {
            self.running = Some(head.request.id());
            head.signal(Admission::Granted);
        }
    }
}

/// Ordered single-flight admission structure
pub struct RequestQueue {
    name: &'static str,
    inner: Mutex<QueueInner>,
}

impl RequestQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append to the tail. The returned signal is granted immediately when
    /// the queue was empty, otherwise once every earlier request is removed.
    pub fn enqueue(&self, request: Arc<Request>) -> TurnSignal {
        let (tx, rx) = oneshot::channel();
        let id = request.id();
        request.mark_waiting();

        let mut inner = self.inner.lock();
        inner.entries.push_back(Entry {
            request,
            turn: Some(tx),
        });
        let position = inner.entries.len() - 1;
        if position == 0 {
            inner.admit_head();
        }
        drop(inner);

        tracing::debug!("[{}] enqueued request {} at position {}", self.name, id, position);
        TurnSignal { rx }
    }

    /// Remove a request wherever it is. Removing the Running head admits
    /// the next request; removing a waiting one withdraws its signal.
    /// Returns false if the request was not queued.
    pub fn remove(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        self.remove_locked(&mut inner, id)
    }

    fn remove_locked(&self, inner: &mut QueueInner, id: RequestId) -> bool {
        let position = inner.entries.iter().position(|e| e.request.id() == id);
        let Some(mut entry) = position.and_then(|p| inner.entries.remove(p)) else {
            return false;
        };
        if inner.running == Some(id) {
            inner.admit_head();
            if let Some(next) = inner.running {
                tracing::debug!("[{}] request {} done, admitting {}", self.name, id, next);
            }
        } else {
            entry.signal(Admission::Withdrawn);
            tracing::debug!("[{}] withdrew waiting request {}", self.name, id);
        }
        true
    }

    /// Remove a request only if it has not been admitted yet. The check and
    /// the removal share one lock so a request granted in between stays put.
    fn withdraw_waiting(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        if inner.running == Some(id) {
            return false;
        }
        self.remove_locked(&mut inner, id)
    }

    /// Cancel every outstanding request of `session`.
    ///
    /// Waiting requests are withdrawn at once. A running one keeps its place
    /// until its execution observes the cancellation and terminates, so the
    /// queue never has two requests executing.
    pub fn cancel_by_session(&self, session: &SessionId) -> Vec<Arc<Request>> {
        let mut inner = self.inner.lock();
        let requests: Vec<_> = inner
            .entries
            .iter()
            .filter(|e| e.request.session() == session && !e.request.is_finished())
            .map(|e| Arc::clone(&e.request))
            .collect();

        for request in &requests {
            request.cancel();
            if inner.running != Some(request.id()) {
                self.remove_locked(&mut inner, request.id());
            }
        }
        drop(inner);

        if !requests.is_empty() {
            tracing::debug!(
                "[{}] cancelled {} request(s) of session {}",
                self.name,
                requests.len(),
                session
            );
        }
        requests
    }

    /// Cancel a request and wait for its completion future to resolve
    pub async fn cancel_and_await(&self, request: &Request) -> RequestResult {
        request.cancel();
        self.withdraw_waiting(request.id());
        request.wait().await
    }

    /// Cancel every queued request and return them so the caller can await
    /// their termination
    pub fn cancel_all(&self) -> Vec<Arc<Request>> {
        let mut inner = self.inner.lock();
        let requests: Vec<_> = inner.entries.iter().map(|e| Arc::clone(&e.request)).collect();
        for request in &requests {
            request.cancel();
        }

        // Withdraw everything behind the running head
        let running = inner.running;
        let mut kept = VecDeque::new();
        for mut entry in inner.entries.drain(..) {
            if Some(entry.request.id()) == running {
                kept.push_back(entry);
            } else {
                entry.signal(Admission::Withdrawn);
            }
        }
        inner.entries = kept;

        if !requests.is_empty() {
            tracing::debug!("[{}] cancelled {} request(s)", self.name, requests.len());
        }
        requests
    }

    /// The currently admitted request
    pub fn running(&self) -> Option<Arc<Request>> {
        let inner = self.inner.lock();
        let id = inner.running?;
        inner
            .entries
            .iter()
            .find(|e| e.request.id() == id)
            .map(|e| Arc::clone(&e.request))
    }

    /// Queued request ids in order, head first
    pub fn ids(&self) -> Vec<RequestId> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.request.id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
