//! Coalescing per-resource work queue.
//!
//! At most one pending task exists per resource id. An id that a worker is
//! processing sits in the in-flight set; tasks for it wait until
//! [`WorkQueue::done`] is called, so no two workers ever hold the same id.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::types::{ReconcileTask, ResourceId};

/// What happened to an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New task, ready for a worker.
    Queued,
    /// Merged into an already pending task for the same id.
    Coalesced,
    /// The id is in flight; the task becomes ready after `done`.
    Deferred,
    /// The queue is closed.
    Rejected,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<ResourceId, ReconcileTask>,
    ready: VecDeque<ResourceId>,
    in_flight: HashSet<ResourceId>,
    closed: bool,
}

impl QueueState {
    /// Index in `ready` of the highest-priority task, oldest first on ties.
    fn best_ready(&self) -> Option<usize> {
        self.ready
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| self.pending.get(id).map(|task| (idx, task)))
            .max_by(|(_, a), (_, b)| {
                a.reason
                    .cmp(&b.reason)
                    .then_with(|| b.enqueued_at.cmp(&a.enqueued_at))
            })
            .map(|(idx, _)| idx)
    }
}

/// Work queue shared by the scheduler and the workers.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, coalescing with any pending task for the same id.
    pub async fn enqueue(&self, task: ReconcileTask) -> EnqueueOutcome {
        let mut state = self.state.lock().await;
        if state.closed {
            return EnqueueOutcome::Rejected;
        }

        if let Some(existing) = state.pending.get_mut(&task.id) {
            existing.coalesce(task.reason, task.enqueued_at);
            trace!(id = %task.id, reason = %existing.reason, "Coalesced task");
            return EnqueueOutcome::Coalesced;
        }

        let id = task.id.clone();
        state.pending.insert(id.clone(), task);
        if state.in_flight.contains(&id) {
            return EnqueueOutcome::Deferred;
        }
        state.ready.push_back(id);
        drop(state);

        self.notify.notify_one();
        EnqueueOutcome::Queued
    }

    /// Wait for the next ready task and mark its id in flight.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<ReconcileTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(idx) = state.best_ready()
                    && let Some(id) = state.ready.remove(idx)
                    && let Some(task) = state.pending.remove(&id)
                {
                    state.in_flight.insert(id);
                    return Some(task);
                }
            }

            notified.await;
        }
    }

    /// Release an in-flight id. A task parked while it was in flight
    /// becomes ready.
    pub async fn done(&self, id: &ResourceId) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(id);
        if state.pending.contains_key(id) && !state.ready.contains(id) {
            state.ready.push_back(id.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Take ownership of `id` without a task, e.g. to poll it.
    ///
    /// Fails if a worker holds it. A pending task for the id is held back
    /// until [`Self::done`].
    pub async fn try_acquire(&self, id: &ResourceId) -> bool {
        let mut state = self.state.lock().await;
        if state.closed || state.in_flight.contains(id) {
            return false;
        }
        state.ready.retain(|ready| ready != id);
        state.in_flight.insert(id.clone());
        true
    }

    /// Drop any pending task for `id`.
    pub async fn forget(&self, id: &ResourceId) {
        let mut state = self.state.lock().await;
        state.pending.remove(id);
        state.ready.retain(|ready| ready != id);
    }

    /// Stop handing out tasks and wake every waiting worker.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Number of pending tasks (ready or parked).
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Reason of the pending task for `id`, if any.
    pub async fn pending_reason(&self, id: &ResourceId) -> Option<crate::types::TaskReason> {
        self.state.lock().await.pending.get(id).map(|t| t.reason)
    }
}
