//! Scheduler loop.
//!
//! Wires the store, queue, reconciler and poller together:
//!
//! - a change listener turns accepted edits into `spec-changed` tasks,
//! - a periodic ticker enqueues a `periodic` task for every resource,
//! - the poller enqueues `external-drift` tasks,
//! - a fixed pool of workers drains the queue.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::metrics::ControllerMetrics;
use crate::poller::Poller;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::store::DesiredStateStore;
use crate::system::ManagedSystem;
use crate::tracker::ObservedStateTracker;
use crate::types::{ReconcileTask, TaskReason};

/// Continuous reconciliation loop.
pub struct ReconciliationLoop {
    store: Arc<DesiredStateStore>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    poller: Poller,
    metrics: Arc<ControllerMetrics>,
    config: ControllerConfig,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    pub fn new(
        store: Arc<DesiredStateStore>,
        tracker: Arc<ObservedStateTracker>,
        queue: Arc<WorkQueue>,
        system: Arc<dyn ManagedSystem>,
        metrics: Arc<ControllerMetrics>,
        config: ControllerConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            Arc::clone(&system),
            Arc::clone(&metrics),
            config.backoff.clone(),
        ));
        let poller = Poller::new(
            Arc::clone(&store),
            tracker,
            Arc::clone(&queue),
            system,
            Arc::clone(&metrics),
            config.poll.clone(),
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            store,
            queue,
            reconciler,
            poller,
            metrics,
            config,
            stop_rx,
            stop_tx,
        }
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Run until stopped.
    ///
    /// Workers finish their current reconcile before the call returns.
    ///
    /// # Errors
    ///
    /// Currently always `Ok`; reconcile errors are logged and never stop the loop.
    pub async fn run(self) -> Result<()> {
        let Self {
            store,
            queue,
            reconciler,
            poller,
            metrics,
            config,
            mut stop_rx,
            stop_tx: _stop_tx,
        } = self;

        info!(
            workers = config.workers,
            resync_ms = u64::try_from(config.resync_interval.as_millis()).unwrap_or(u64::MAX),
            "Starting reconciliation loop"
        );

        // Subscribed before the initial resync.
        let changes = store.subscribe();
        resync(&store, &queue, TaskReason::Periodic).await;

        let mut tasks = JoinSet::new();
        for worker in 0..config.workers {
            tasks.spawn(run_worker(
                worker,
                Arc::clone(&queue),
                Arc::clone(&reconciler),
                Arc::clone(&metrics),
            ));
        }
        tasks.spawn(run_change_listener(
            Arc::clone(&store),
            Arc::clone(&queue),
            changes,
            stop_rx.clone(),
        ));
        tasks.spawn(run_resync_ticker(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.resync_interval,
            stop_rx.clone(),
        ));
        tasks.spawn(poller.run(stop_rx.clone()));

        while !*stop_rx.borrow_and_update() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }

        info!("Stopping reconciliation loop");
        queue.close().await;

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Loop task failed");
            }
        }

        info!("Reconciliation loop stopped");
        Ok(())
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<ControllerMetrics>,
) {
    debug!(worker, "Worker started");

    while let Some(task) = queue.next().await {
        metrics.set_queue_depth(queue.len().await);

        match reconciler.reconcile(&task).await {
            Ok(outcome) => debug!(worker, id = %task.id, ?outcome, "Reconcile finished"),
            Err(err) => warn!(worker, id = %task.id, error = %err, "Reconcile failed"),
        }

        queue.done(&task.id).await;
    }

    debug!(worker, "Worker stopped");
}

async fn run_change_listener(
    store: Arc<DesiredStateStore>,
    queue: Arc<WorkQueue>,
    mut changes: tokio::sync::broadcast::Receiver<crate::store::SpecChange>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = changes.recv() => match received {
                Ok(change) => {
                    let outcome = queue
                        .enqueue(ReconcileTask::new(change.id.clone(), TaskReason::SpecChanged))
                        .await;
                    debug!(id = %change.id, generation = change.generation, ?outcome, "Spec change queued");
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Change listener lagged, resyncing every resource");
                    resync(&store, &queue, TaskReason::SpecChanged).await;
                }
                Err(RecvError::Closed) => return,
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_resync_ticker(
    store: Arc<DesiredStateStore>,
    queue: Arc<WorkQueue>,
    period: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let first = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => resync(&store, &queue, TaskReason::Periodic).await,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

/// Enqueue a task with `reason` for every managed resource.
async fn resync(store: &DesiredStateStore, queue: &WorkQueue, reason: TaskReason) {
    let ids = store.ids().await;
    debug!(count = ids.len(), %reason, "Resync");
    for id in ids {
        queue.enqueue(ReconcileTask::new(id, reason)).await;
    }
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::system::InMemoryCluster;
    use crate::types::{DesiredAttributes, ReconcilePhase, ResourceId, ResourceSpec};

    fn setup() -> (
        ReconciliationLoop,
        Arc<DesiredStateStore>,
        Arc<ObservedStateTracker>,
    ) {
        let store = Arc::new(DesiredStateStore::new());
        let tracker = Arc::new(ObservedStateTracker::new(3));
        let looper = ReconciliationLoop::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            Arc::new(WorkQueue::new()),
            Arc::new(InMemoryCluster::new()),
            Arc::new(ControllerMetrics::new()),
            ControllerConfig::default().with_workers(2),
        );
        (looper, store, tracker)
    }

    /// Given a loop that is running
    /// When stop() is called
    /// Then the loop should exit gracefully
    #[tokio::test]
    async fn stop_signal_terminates_loop() {
        let (looper, _, _) = setup();
        let stopper = looper.stopper();
        let handle = tokio::spawn(looper.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))), "Loop should stop within timeout");
    }

    /// Given a spec submitted before the loop starts
    /// When the loop starts
    /// Then the initial resync reconciles it
    #[tokio::test]
    async fn initial_resync_picks_up_existing_specs() {
        let (looper, store, tracker) = setup();
        let id = ResourceId::deployment("shop", "web");
        let _ = store
            .submit(ResourceSpec::new(
                id.clone(),
                DesiredAttributes::with_image("web:1").replicas(2),
            ))
            .await;

        let stopper = looper.stopper();
        let handle = tokio::spawn(looper.run());

        let converged = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if tracker.get(&id).await.is_some_and(|s| s.phase == ReconcilePhase::Converged) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(converged.is_ok());

        stopper.stop();
        let _ = handle.await;
    }
}
