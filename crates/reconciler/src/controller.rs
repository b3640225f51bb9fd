//! Caller-facing controller handle.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::action::Action;
use crate::config::ControllerConfig;
use crate::diff::diff;
use crate::error::{Error, Result};
use crate::metrics::{ControllerMetrics, MetricsSnapshot};
use crate::queue::WorkQueue;
use crate::r#loop::{LoopStopper, ReconciliationLoop};
use crate::store::DesiredStateStore;
use crate::system::ManagedSystem;
use crate::tracker::ObservedStateTracker;
use crate::types::{ResourceId, ResourceSpec, ResourceStatus};

/// Cheap-to-clone handle over the store, tracker and loop.
#[derive(Clone)]
pub struct Controller {
    store: Arc<DesiredStateStore>,
    tracker: Arc<ObservedStateTracker>,
    queue: Arc<WorkQueue>,
    system: Arc<dyn ManagedSystem>,
    metrics: Arc<ControllerMetrics>,
    config: ControllerConfig,
}

/// A started loop.
pub struct RunningLoop {
    pub stopper: LoopStopper,
    pub handle: JoinHandle<Result<()>>,
}

impl RunningLoop {
    /// Stop the loop and wait for workers to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoopStopped`] if the loop task panicked or was cancelled.
    pub async fn shutdown(self) -> Result<()> {
        self.stopper.stop();
        self.handle.await.map_err(|_| Error::LoopStopped)?
    }
}

impl Controller {
    /// Create a controller over `system`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(system: Arc<dyn ManagedSystem>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(DesiredStateStore::new()),
            tracker: Arc::new(ObservedStateTracker::new(config.poll.stale_after_failures)),
            queue: Arc::new(WorkQueue::new()),
            system,
            metrics: Arc::new(ControllerMetrics::new()),
            config,
        })
    }

    /// Submit a desired spec. Returns the accepted spec with its generation.
    ///
    /// A converged or degraded resource moves back to `Pending` when the
    /// generation changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the spec is rejected.
    pub async fn submit(&self, spec: ResourceSpec) -> Result<ResourceSpec> {
        let previous = self.store.get(&spec.id).await.map(|s| s.generation);
        let accepted = self.store.submit(spec).await?;

        if previous != Some(accepted.generation)
            && let Some(status) = self.tracker.mark_pending(&accepted.id).await
        {
            self.metrics.set_health(&accepted.id, status.health);
        }
        Ok(accepted)
    }

    /// Submit several specs concurrently. Results keep the input order.
    pub async fn submit_all(
        &self,
        specs: impl IntoIterator<Item = ResourceSpec>,
    ) -> Vec<Result<ResourceSpec>> {
        futures::future::join_all(specs.into_iter().map(|spec| self.submit(spec))).await
    }

    /// Current status of a resource.
    pub async fn status(&self, id: &ResourceId) -> Option<ResourceStatus> {
        self.tracker.get(id).await
    }

    /// Status of every tracked resource, ordered by id.
    pub async fn list_status(&self) -> Vec<ResourceStatus> {
        self.tracker.list().await
    }

    /// Latest accepted spec for a resource.
    pub async fn spec(&self, id: &ResourceId) -> Option<ResourceSpec> {
        self.store.get(id).await
    }

    /// Actions the next reconcile would apply, from the tracked observed state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if the resource is not managed.
    pub async fn plan(&self, id: &ResourceId) -> Result<Vec<Action>> {
        let spec = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::resource_not_found(id))?;
        let status = self.tracker.get(id).await;
        Ok(diff(&spec, status.as_ref()))
    }

    /// Stop managing a resource. Nothing is deleted in the managed system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if the resource is not managed.
    pub async fn remove(&self, id: &ResourceId) -> Result<ResourceSpec> {
        let removed = self
            .store
            .remove(id)
            .await
            .ok_or_else(|| Error::resource_not_found(id))?;
        self.queue.forget(id).await;
        self.tracker.remove(id).await;
        self.metrics.forget(id);
        info!(id = %id, "Stopped managing resource");
        Ok(removed)
    }

    /// Current metrics.
    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.set_queue_depth(self.queue.len().await);
        self.metrics.snapshot()
    }

    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Build the reconciliation loop without starting it.
    pub fn reconciliation_loop(&self) -> ReconciliationLoop {
        ReconciliationLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.tracker),
            Arc::clone(&self.queue),
            Arc::clone(&self.system),
            Arc::clone(&self.metrics),
            self.config.clone(),
        )
    }

    /// Spawn the reconciliation loop on the current runtime.
    pub fn start(&self) -> RunningLoop {
        let looper = self.reconciliation_loop();
        let stopper = looper.stopper();
        let handle = tokio::spawn(looper.run());
        RunningLoop { stopper, handle }
    }
}
