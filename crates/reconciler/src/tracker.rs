//! Observed-state tracker.
//!
//! Mirrors the live state of each managed resource. Entries are written by
//! the worker that currently owns the resource or by the poller; the
//! ownership token is the work queue's in-flight slot.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{Health, ObservedAttributes, ReconcilePhase, ResourceId, ResourceStatus};

/// Result of recording a failed poll.
#[derive(Debug, Clone)]
pub struct PollFailure {
    pub status: ResourceStatus,
    /// Whether this failure crossed the staleness threshold.
    pub became_stale: bool,
}

/// Thread-safe map of resource id to observed status.
pub struct ObservedStateTracker {
    entries: RwLock<HashMap<ResourceId, ResourceStatus>>,
    stale_after_failures: u32,
}

impl ObservedStateTracker {
    /// Create a tracker that marks health `Unknown` after `stale_after_failures`
    /// consecutive poll failures.
    pub fn new(stale_after_failures: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stale_after_failures: stale_after_failures.max(1),
        }
    }

    /// Overwrite the status of a resource.
    ///
    /// Monotonic on generation: a status older than the stored one is
    /// rejected and `false` is returned.
    pub async fn record(&self, status: ResourceStatus) -> bool {
        let mut entries = self.entries.write().await;
        if let Some(current) = entries.get(&status.id)
            && status.observed_generation < current.observed_generation
        {
            debug!(
                id = %status.id,
                stored = current.observed_generation,
                offered = status.observed_generation,
                "Rejected stale status"
            );
            return false;
        }
        entries.insert(status.id.clone(), status);
        true
    }

    /// Get the status of a resource.
    pub async fn get(&self, id: &ResourceId) -> Option<ResourceStatus> {
        self.entries.read().await.get(id).cloned()
    }

    /// All statuses, ordered by id.
    pub async fn list(&self) -> Vec<ResourceStatus> {
        let mut statuses: Vec<ResourceStatus> =
            self.entries.read().await.values().cloned().collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Get the status, creating a fresh `Pending`/`Unknown` entry if absent.
    pub async fn ensure(&self, id: &ResourceId) -> ResourceStatus {
        self.entries
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| ResourceStatus::new(id.clone()))
            .clone()
    }

    /// Mutate a status in place.
    ///
    /// The closure may fail (e.g. on an invalid phase transition); the entry
    /// is left untouched in that case. Generation is never allowed to move
    /// backwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if the id is not tracked, or the
    /// closure's error.
    pub async fn update<F>(&self, id: &ResourceId, f: F) -> Result<ResourceStatus, Error>
    where
        F: FnOnce(&mut ResourceStatus) -> Result<(), Error>,
    {
        let mut entries = self.entries.write().await;
        let current = entries
            .get_mut(id)
            .ok_or_else(|| Error::resource_not_found(id))?;

        let mut next = current.clone();
        f(&mut next)?;
        if next.observed_generation < current.observed_generation {
            warn!(id = %id, "Refusing to move observed generation backwards");
            next.observed_generation = current.observed_generation;
        }
        next.updated_at = Utc::now();
        *current = next.clone();
        Ok(next)
    }

    /// Record a successful poll.
    ///
    /// Resets the failure counter and replaces observed attributes. Health
    /// that went `Unknown` because of failed polls is recomputed from phase.
    pub async fn record_observation(
        &self,
        id: &ResourceId,
        observed: ObservedAttributes,
    ) -> Option<ResourceStatus> {
        let mut entries = self.entries.write().await;
        let status = entries.get_mut(id)?;

        let was_stale = status.consecutive_poll_failures >= self.stale_after_failures;
        status.observed = observed;
        status.consecutive_poll_failures = 0;
        status.last_polled_at = Some(Utc::now());
        status.updated_at = Utc::now();
        if was_stale {
            status.health = health_for_phase(status.phase);
        }
        Some(status.clone())
    }

    /// Record a failed poll. Prior observed attributes stay intact.
    pub async fn record_poll_failure(&self, id: &ResourceId, reason: &str) -> Option<PollFailure> {
        let mut entries = self.entries.write().await;
        let status = entries.get_mut(id)?;

        status.consecutive_poll_failures = status.consecutive_poll_failures.saturating_add(1);
        status.updated_at = Utc::now();

        let became_stale = status.consecutive_poll_failures == self.stale_after_failures;
        if status.consecutive_poll_failures >= self.stale_after_failures {
            status.health = Health::Unknown;
        }
        if became_stale {
            let err = Error::tracker_stale(id, status.consecutive_poll_failures);
            warn!(error = %err, reason, "Observed state is stale");
        } else {
            debug!(id = %id, failures = status.consecutive_poll_failures, reason, "Poll failed");
        }

        Some(PollFailure {
            status: status.clone(),
            became_stale,
        })
    }

    /// Move a converged or degraded resource back to `Pending`.
    ///
    /// In-flight resources are left alone; their worker notices the new
    /// generation itself.
    pub async fn mark_pending(&self, id: &ResourceId) -> Option<ResourceStatus> {
        let mut entries = self.entries.write().await;
        let status = entries
            .entry(id.clone())
            .or_insert_with(|| ResourceStatus::new(id.clone()));
        if matches!(
            status.phase,
            ReconcilePhase::Converged | ReconcilePhase::Degraded
        ) {
            status.phase = ReconcilePhase::Pending;
            status.updated_at = Utc::now();
        }
        Some(status.clone())
    }

    /// Stop tracking a resource.
    pub async fn remove(&self, id: &ResourceId) -> Option<ResourceStatus> {
        self.entries.write().await.remove(id)
    }

    /// Whether the resource's status is currently stale.
    pub async fn is_stale(&self, id: &ResourceId) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .is_some_and(|s| s.consecutive_poll_failures >= self.stale_after_failures)
    }
}

/// Health implied by a reconcile phase once observations are fresh.
pub const fn health_for_phase(phase: ReconcilePhase) -> Health {
    match phase {
        ReconcilePhase::Converged => Health::Healthy,
        ReconcilePhase::Degraded => Health::Degraded,
        ReconcilePhase::Pending | ReconcilePhase::InProgress => Health::Unknown,
    }
}
