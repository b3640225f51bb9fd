//! Per-resource reconciliation.
//!
//! One [`Reconciler::reconcile`] call drives a single resource from its
//! observed state towards the latest accepted spec:
//!
//! 1. refresh observed attributes from the managed system,
//! 2. diff against the spec,
//! 3. apply the actions in order, retrying transient failures with backoff.
//!
//! The caller (a worker) owns the resource id for the whole call, so every
//! tracker write here is serialized per id.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::backoff::BackoffPolicy;
use crate::diff::diff;
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::store::DesiredStateStore;
use crate::system::ManagedSystem;
use crate::tracker::ObservedStateTracker;
use crate::types::{
    ActionResult, DegradedCause, Health, ReconcilePhase, ReconcileTask, ResourceId, ResourceSpec,
};

/// Why a reconcile did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The spec was removed before the task ran.
    Removed,
    /// The resource is already converged at the current generation.
    AlreadyConverged,
    /// Permanently degraded at the current generation; waits for a new spec.
    AwaitingSpecChange,
}

/// Result of one reconcile run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Converged { generation: u64, actions: usize },
    Degraded { generation: u64, cause: DegradedCause },
    /// A newer generation arrived before any action was applied.
    Superseded { generation: u64 },
    Skipped { reason: SkipReason },
}

impl ReconcileOutcome {
    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

/// How one action's retry loop ended.
enum ActionOutcome {
    Applied,
    Failed(DegradedCause, Error),
    Superseded,
}

/// Drives resources towards their desired state.
pub struct Reconciler {
    store: Arc<DesiredStateStore>,
    tracker: Arc<ObservedStateTracker>,
    system: Arc<dyn ManagedSystem>,
    metrics: Arc<ControllerMetrics>,
    backoff: BackoffPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<DesiredStateStore>,
        tracker: Arc<ObservedStateTracker>,
        system: Arc<dyn ManagedSystem>,
        metrics: Arc<ControllerMetrics>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            tracker,
            system,
            metrics,
            backoff,
        }
    }

    /// Reconcile the resource named by `task`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the tracker rejects a status update, e.g.
    /// because the resource was removed mid-run. Action failures are
    /// reported through the outcome and the resource status.
    pub async fn reconcile(&self, task: &ReconcileTask) -> Result<ReconcileOutcome> {
        let id = &task.id;

        let (Some(spec), Some(mut generation_rx)) = (
            self.store.get(id).await,
            self.store.watch_generation(id).await,
        ) else {
            debug!(id = %id, task_id = %task.task_id, "Spec removed, nothing to do");
            return Ok(ReconcileOutcome::Skipped {
                reason: SkipReason::Removed,
            });
        };
        let generation = spec.generation;

        let status = self.tracker.ensure(id).await;
        if status.phase == ReconcilePhase::Degraded
            && status.degraded_cause == Some(DegradedCause::PermanentFailure)
            && status.attempted_generation == generation
        {
            debug!(id = %id, generation, "Permanently degraded, waiting for a new spec");
            return Ok(ReconcileOutcome::Skipped {
                reason: SkipReason::AwaitingSpecChange,
            });
        }

        self.refresh_observed(id).await;
        let current = self.tracker.get(id).await;
        let actions = diff(&spec, current.as_ref());

        if actions.is_empty() && current.as_ref().is_some_and(|s| s.is_converged_at(generation)) {
            return Ok(ReconcileOutcome::Skipped {
                reason: SkipReason::AlreadyConverged,
            });
        }

        self.begin(id, generation).await?;
        self.metrics.reconcile_started();
        info!(
            id = %id,
            generation,
            reason = %task.reason,
            task_id = %task.task_id,
            actions = actions.len(),
            "Reconciling"
        );

        let mut applied = 0usize;
        for action in &actions {
            if applied == 0 && is_superseded(&generation_rx, generation) {
                return self.supersede(id, generation).await;
            }

            match self
                .apply_with_retry(id, action, generation, applied == 0, &mut generation_rx)
                .await?
            {
                ActionOutcome::Applied => applied = applied.saturating_add(1),
                ActionOutcome::Superseded => return self.supersede(id, generation).await,
                ActionOutcome::Failed(cause, err) => {
                    return self.degrade(id, generation, cause, &err).await;
                }
            }
        }

        self.converge(&spec, applied, &generation_rx).await
    }

    async fn refresh_observed(&self, id: &ResourceId) {
        match self.system.poll_status(id).await {
            Ok(observed) => {
                self.tracker.record_observation(id, observed).await;
            }
            Err(err) => {
                self.metrics.poll_failed();
                debug!(id = %id, error = %err, "Reconciling against last-known state");
                self.tracker.record_poll_failure(id, &err.to_string()).await;
            }
        }
    }

    async fn begin(&self, id: &ResourceId, generation: u64) -> Result<()> {
        self.tracker
            .update(id, |s| {
                if s.phase != ReconcilePhase::Pending {
                    s.transition(ReconcilePhase::Pending)?;
                }
                s.transition(ReconcilePhase::InProgress)?;
                s.attempted_generation = generation;
                s.degraded_cause = None;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Apply one action, retrying transient failures.
    ///
    /// While `may_supersede` holds, a newer generation arriving during a
    /// backoff sleep aborts the retry loop.
    async fn apply_with_retry(
        &self,
        id: &ResourceId,
        action: &Action,
        generation: u64,
        may_supersede: bool,
        generation_rx: &mut watch::Receiver<u64>,
    ) -> Result<ActionOutcome> {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);

            let started = Instant::now();
            let result = self.system.apply_action(id, action).await;
            self.metrics
                .action_finished(action.name(), &result, started.elapsed());

            match result {
                ActionResult::Success => {
                    debug!(id = %id, action = %action, attempts, "Action applied");
                    self.tracker
                        .update(id, |s| {
                            action.apply_to(&mut s.observed);
                            Ok(())
                        })
                        .await?;
                    return Ok(ActionOutcome::Applied);
                }
                ActionResult::Permanent(reason) => {
                    let err = Error::permanent_action(action.name(), reason);
                    return Ok(ActionOutcome::Failed(DegradedCause::PermanentFailure, err));
                }
                ActionResult::Transient(reason) => {
                    let err = Error::transient_action(action.name(), reason);
                    if !self.backoff.allows_attempt(attempts) {
                        return Ok(ActionOutcome::Failed(DegradedCause::RetriesExhausted, err));
                    }

                    let delay = self.backoff.delay_for(attempts);
                    warn!(
                        id = %id,
                        error = %err,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying after transient failure"
                    );

                    if may_supersede {
                        if sleep_unless_superseded(generation_rx, generation, delay).await {
                            return Ok(ActionOutcome::Superseded);
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn converge(
        &self,
        spec: &ResourceSpec,
        actions: usize,
        generation_rx: &watch::Receiver<u64>,
    ) -> Result<ReconcileOutcome> {
        let generation = spec.generation;
        let newer_pending = is_superseded(generation_rx, generation);

        let status = self
            .tracker
            .update(&spec.id, |s| {
                s.transition(ReconcilePhase::Converged)?;
                s.observed_generation = generation;
                s.health = Health::Healthy;
                s.last_error = None;
                s.degraded_cause = None;
                s.last_reconciled_at = Some(Utc::now());
                if newer_pending {
                    s.transition(ReconcilePhase::Pending)?;
                }
                Ok(())
            })
            .await?;

        self.metrics.reconcile_converged();
        self.metrics.set_health(&spec.id, status.health);
        info!(id = %spec.id, generation, actions, "Converged");

        Ok(ReconcileOutcome::Converged {
            generation,
            actions,
        })
    }

    async fn degrade(
        &self,
        id: &ResourceId,
        generation: u64,
        cause: DegradedCause,
        err: &Error,
    ) -> Result<ReconcileOutcome> {
        let message = err.to_string();
        self.tracker
            .update(id, |s| {
                s.transition(ReconcilePhase::Degraded)?;
                s.health = Health::Degraded;
                s.degraded_cause = Some(cause);
                s.last_error = Some(message.clone());
                s.last_reconciled_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        self.metrics.reconcile_degraded();
        self.metrics.set_health(id, Health::Degraded);
        error!(id = %id, generation, cause = ?cause, error = %message, "Reconcile degraded");

        Ok(ReconcileOutcome::Degraded { generation, cause })
    }

    async fn supersede(&self, id: &ResourceId, generation: u64) -> Result<ReconcileOutcome> {
        self.tracker
            .update(id, |s| s.transition(ReconcilePhase::Pending))
            .await?;
        self.metrics.reconcile_superseded();
        info!(id = %id, generation, "Superseded by a newer spec");
        Ok(ReconcileOutcome::Superseded { generation })
    }
}

/// Whether the store holds a newer generation than `generation`, or none at all.
fn is_superseded(rx: &watch::Receiver<u64>, generation: u64) -> bool {
    rx.has_changed().is_err() || *rx.borrow() > generation
}

/// Sleep for `delay`, returning early with `true` if the spec is superseded.
async fn sleep_unless_superseded(
    rx: &mut watch::Receiver<u64>,
    generation: u64,
    delay: std::time::Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return false,
            changed = rx.changed() => {
                if changed.is_err() || *rx.borrow_and_update() > generation {
                    return true;
                }
            }
        }
    }
}
