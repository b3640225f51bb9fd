//! Observed-state poller.
//!
//! A single task that refreshes the tracker from the managed system and
//! turns external drift on converged resources into reconcile tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::PollConfig;
use crate::diff::diff;
use crate::metrics::ControllerMetrics;
use crate::queue::WorkQueue;
use crate::store::DesiredStateStore;
use crate::system::{ManagedSystem, PollError};
use crate::tracker::ObservedStateTracker;
use crate::types::{ReconcilePhase, ReconcileTask, ResourceId, ResourceSpec, TaskReason};

/// Counts from one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub failed: usize,
    pub drifted: usize,
    /// Due but held by a worker.
    pub busy: usize,
}

/// Periodic observed-state refresher.
pub struct Poller {
    store: Arc<DesiredStateStore>,
    tracker: Arc<ObservedStateTracker>,
    queue: Arc<WorkQueue>,
    system: Arc<dyn ManagedSystem>,
    metrics: Arc<ControllerMetrics>,
    config: PollConfig,
    last_polled: HashMap<ResourceId, Instant>,
}

impl Poller {
    pub fn new(
        store: Arc<DesiredStateStore>,
        tracker: Arc<ObservedStateTracker>,
        queue: Arc<WorkQueue>,
        system: Arc<dyn ManagedSystem>,
        metrics: Arc<ControllerMetrics>,
        config: PollConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            queue,
            system,
            metrics,
            config,
            last_polled: HashMap::new(),
        }
    }

    /// Poll every resource whose interval has elapsed at `now`.
    pub async fn poll_once(&mut self, now: Instant) -> PollReport {
        let specs = self.store.list().await;
        self.last_polled
            .retain(|id, _| specs.iter().any(|spec| &spec.id == id));

        let mut report = PollReport::default();
        for spec in specs {
            let interval = spec.poll_interval.unwrap_or(self.config.interval);
            let due = self
                .last_polled
                .get(&spec.id)
                .is_none_or(|last| now.saturating_duration_since(*last) >= interval);
            if !due {
                continue;
            }

            if !self.queue.try_acquire(&spec.id).await {
                report.busy = report.busy.saturating_add(1);
                continue;
            }
            self.last_polled.insert(spec.id.clone(), now);

            let polled = self.poll_resource(&spec, interval).await;
            self.queue.done(&spec.id).await;

            report.polled = report.polled.saturating_add(1);
            match polled {
                Polled::Ok => {}
                Polled::Failed => report.failed = report.failed.saturating_add(1),
                Polled::Drifted => report.drifted = report.drifted.saturating_add(1),
            }
        }
        report
    }

    /// Poll one resource. The caller owns the id.
    async fn poll_resource(&self, spec: &ResourceSpec, timeout: std::time::Duration) -> Polled {
        let id = &spec.id;
        self.tracker.ensure(id).await;

        let result = match tokio::time::timeout(timeout, self.system.poll_status(id)).await {
            Ok(result) => result,
            Err(_) => Err(PollError::Timeout { after: timeout }),
        };

        let observed = match result {
            Ok(observed) => observed,
            Err(err) => {
                self.metrics.poll_failed();
                if let Some(failure) = self.tracker.record_poll_failure(id, &err.to_string()).await {
                    self.metrics.set_health(id, failure.status.health);
                }
                return Polled::Failed;
            }
        };

        let Some(status) = self.tracker.record_observation(id, observed).await else {
            return Polled::Ok;
        };
        self.metrics.set_health(id, status.health);

        if status.phase != ReconcilePhase::Converged || status.observed_generation != spec.generation
        {
            return Polled::Ok;
        }

        let actions = diff(spec, Some(&status));
        if actions.is_empty() {
            return Polled::Ok;
        }

        info!(id = %id, actions = actions.len(), "External drift detected");
        self.metrics.drift_detected();
        let outcome = self
            .queue
            .enqueue(ReconcileTask::new(id.clone(), TaskReason::ExternalDrift))
            .await;
        debug!(id = %id, outcome = ?outcome, "Enqueued drift correction");
        Polled::Drifted
    }

    /// Poll on every tick until `stop` turns true.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_ms = u64::try_from(self.config.tick.as_millis()).unwrap_or(u64::MAX),
            "Starting poller"
        );

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    let report = self.poll_once(now).await;
                    if report.polled > 0 {
                        debug!(?report, "Poll pass finished");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Poller stopped");
                        return;
                    }
                }
            }
        }
    }
}

enum Polled {
    Ok,
    Failed,
    Drifted,
}
