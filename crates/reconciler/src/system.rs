//! The managed system seam.
//!
//! [`ManagedSystem`] is everything the controller needs from the outside
//! world: apply one corrective action, and report the current observed
//! attributes of a resource. [`InMemoryCluster`] is a simulated system with
//! fault injection for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::action::Action;
use crate::types::{ActionResult, ObservedAttributes, ResourceId};

/// Failure to read the observed state of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// The managed system could not be reached or refused the read.
    #[error("managed system unavailable: {reason}")]
    Unavailable { reason: String },

    /// The read did not complete in time.
    #[error("poll timed out after {after:?}")]
    Timeout { after: Duration },
}

impl PollError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// The system under management.
#[async_trait]
pub trait ManagedSystem: Send + Sync {
    /// Apply a single corrective action.
    ///
    /// Actions are idempotent: applying one whose effect is already present
    /// must succeed without side effects.
    async fn apply_action(&self, id: &ResourceId, action: &Action) -> ActionResult;

    /// Read the current observed attributes. A resource that does not exist
    /// yet reports the empty observed state.
    async fn poll_status(&self, id: &ResourceId) -> Result<ObservedAttributes, PollError>;
}

#[derive(Default)]
struct ClusterState {
    resources: HashMap<ResourceId, ObservedAttributes>,
    scripts: HashMap<ResourceId, VecDeque<ActionResult>>,
    failing_polls: HashMap<ResourceId, u32>,
    applied: Vec<(ResourceId, Action)>,
}

/// Simulated cluster.
///
/// Each resource is a map entry of observed attributes. Action results can
/// be scripted per resource; unscripted actions succeed.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    latency: Duration,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue results for the next `apply_action` calls on `id`, in order.
    pub async fn script(&self, id: &ResourceId, results: impl IntoIterator<Item = ActionResult>) {
        self.state
            .lock()
            .await
            .scripts
            .entry(id.clone())
            .or_default()
            .extend(results);
    }

    /// Make the next `count` polls of `id` fail. `u32::MAX` fails until cleared.
    pub async fn fail_polls(&self, id: &ResourceId, count: u32) {
        let mut state = self.state.lock().await;
        if count == 0 {
            state.failing_polls.remove(id);
        } else {
            state.failing_polls.insert(id.clone(), count);
        }
    }

    /// Change a resource behind the controller's back (external drift).
    pub async fn mutate<F>(&self, id: &ResourceId, f: F)
    where
        F: FnOnce(&mut ObservedAttributes),
    {
        let mut state = self.state.lock().await;
        f(state.resources.entry(id.clone()).or_default());
    }

    /// Current attributes of a resource, if it exists.
    pub async fn observed(&self, id: &ResourceId) -> Option<ObservedAttributes> {
        self.state.lock().await.resources.get(id).cloned()
    }

    /// Every successfully applied action, in application order.
    pub async fn applied_actions(&self) -> Vec<(ResourceId, Action)> {
        self.state.lock().await.applied.clone()
    }

    /// Successfully applied actions for one resource.
    pub async fn applied_for(&self, id: &ResourceId) -> Vec<Action> {
        self.state
            .lock()
            .await
            .applied
            .iter()
            .filter(|(applied_id, _)| applied_id == id)
            .map(|(_, action)| action.clone())
            .collect()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ManagedSystem for InMemoryCluster {
    async fn apply_action(&self, id: &ResourceId, action: &Action) -> ActionResult {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        let result = state
            .scripts
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ActionResult::Success);

        if result.is_success() {
            action.apply_to(state.resources.entry(id.clone()).or_default());
            state.applied.push((id.clone(), action.clone()));
        }

        debug!(id = %id, action = %action, result = result.class(), "Simulated action");
        result
    }

    async fn poll_status(&self, id: &ResourceId) -> Result<ObservedAttributes, PollError> {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(remaining) = state.failing_polls.get_mut(id) {
            if *remaining != u32::MAX {
                *remaining = remaining.saturating_sub(1);
            }
            if *remaining == 0 {
                state.failing_polls.remove(id);
            }
            return Err(PollError::unavailable(format!("injected failure for {id}")));
        }

        Ok(state.resources.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ResourceId {
        ResourceId::deployment("shop", "web")
    }

    #[tokio::test]
    async fn unscripted_actions_succeed_and_apply() {
        let cluster = InMemoryCluster::new();
        let result = cluster
            .apply_action(&id(), &Action::SetReplicas { from: 0, to: 3 })
            .await;
        assert_eq!(result, ActionResult::Success);
        assert_eq!(cluster.observed(&id()).await.map(|o| o.replicas), Some(3));
    }

    #[tokio::test]
    async fn scripted_results_are_consumed_in_order() {
        let cluster = InMemoryCluster::new();
        cluster
            .script(
                &id(),
                [
                    ActionResult::Transient("busy".into()),
                    ActionResult::Permanent("quota".into()),
                ],
            )
            .await;
        let action = Action::SetReplicas { from: 0, to: 1 };

        assert!(matches!(
            cluster.apply_action(&id(), &action).await,
            ActionResult::Transient(_)
        ));
        assert!(matches!(
            cluster.apply_action(&id(), &action).await,
            ActionResult::Permanent(_)
        ));
        assert!(cluster.apply_action(&id(), &action).await.is_success());
        assert_eq!(cluster.applied_for(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_resource_polls_as_empty() {
        let cluster = InMemoryCluster::new();
        assert_eq!(
            cluster.poll_status(&id()).await,
            Ok(ObservedAttributes::default())
        );
    }

    #[tokio::test]
    async fn injected_poll_failures_run_out() {
        let cluster = InMemoryCluster::new();
        cluster.fail_polls(&id(), 2).await;
        assert!(cluster.poll_status(&id()).await.is_err());
        assert!(cluster.poll_status(&id()).await.is_err());
        assert!(cluster.poll_status(&id()).await.is_ok());
    }

    #[tokio::test]
    async fn mutate_simulates_drift() {
        let cluster = InMemoryCluster::new();
        cluster.mutate(&id(), |o| o.replicas = 7).await;
        assert_eq!(cluster.poll_status(&id()).await.map(|o| o.replicas), Ok(7));
    }
}
