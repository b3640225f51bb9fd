//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::Error;

/// Workload kinds the controller manages.
///
/// Serialized in lower case to match identifiers and URLs; the manifest
/// spelling (`Deployment`) is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[serde(alias = "Deployment")]
    Deployment,
    #[serde(alias = "StatefulSet")]
    StatefulSet,
    #[serde(alias = "DaemonSet")]
    DaemonSet,
}

impl ResourceKind {
    /// Lower-case name used in identifiers and URLs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" => Ok(Self::Deployment),
            "statefulset" => Ok(Self::StatefulSet),
            "daemonset" => Ok(Self::DaemonSet),
            other => Err(Error::validation("kind", format!("unsupported kind '{other}'"))),
        }
    }
}

/// Identity of a managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    /// Create a new identifier.
    pub fn new(namespace: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for a deployment identifier.
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, ResourceKind::Deployment, name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Resource limit dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Cpu,
    Memory,
}

impl LimitKind {
    /// All limit kinds in declaration order.
    pub const ALL: [Self; 2] = [Self::Cpu, Self::Memory];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container resource limits. CPU in millicores, memory in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u32>,
    pub memory_mib: Option<u32>,
}

impl ResourceLimits {
    /// Get the limit for a dimension.
    pub const fn get(&self, kind: LimitKind) -> Option<u32> {
        match kind {
            LimitKind::Cpu => self.cpu_millis,
            LimitKind::Memory => self.memory_mib,
        }
    }

    /// Set or clear the limit for a dimension.
    pub fn set(&mut self, kind: LimitKind, value: Option<u32>) {
        match kind {
            LimitKind::Cpu => self.cpu_millis = value,
            LimitKind::Memory => self.memory_mib = value,
        }
    }
}

/// Attributes the caller wants the managed system to converge to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredAttributes {
    /// Replica count (default 1).
    pub replicas: u32,
    /// Container image reference. Required.
    pub image: String,
    /// Resource limits (default: none).
    pub limits: ResourceLimits,
    /// Labels (default: none).
    pub labels: BTreeMap<String, String>,
}

impl Default for DesiredAttributes {
    fn default() -> Self {
        Self {
            replicas: 1,
            image: String::new(),
            limits: ResourceLimits::default(),
            labels: BTreeMap::new(),
        }
    }
}

impl DesiredAttributes {
    /// Attributes running `image` with the default replica count.
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    #[must_use]
    pub fn limit(mut self, kind: LimitKind, value: u32) -> Self {
        match kind {
            LimitKind::Cpu => self.limits.cpu_millis = Some(value),
            LimitKind::Memory => self.limits.memory_mib = Some(value),
        }
        self
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A submitted resource specification.
///
/// The generation is assigned by the desired-state store; whatever the
/// caller puts there is overwritten on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub attributes: DesiredAttributes,
    #[serde(default)]
    pub generation: u64,
    /// Per-resource poll interval override.
    #[serde(default, with = "crate::config::duration_ms_opt")]
    pub poll_interval: Option<Duration>,
}

impl ResourceSpec {
    /// Create a spec with generation 0 (unassigned).
    pub fn new(id: ResourceId, attributes: DesiredAttributes) -> Self {
        Self {
            id,
            attributes,
            generation: 0,
            poll_interval: None,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Whether two specs describe the same desired state, ignoring generation.
    pub fn same_desired_state(&self, other: &Self) -> bool {
        self.attributes == other.attributes && self.poll_interval == other.poll_interval
    }
}

/// Attributes as reported by the managed system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservedAttributes {
    pub replicas: u32,
    pub image: Option<String>,
    pub limits: ResourceLimits,
    pub labels: BTreeMap<String, String>,
}

impl ObservedAttributes {
    /// Observed attributes that exactly match a desired state.
    pub fn matching(desired: &DesiredAttributes) -> Self {
        Self {
            replicas: desired.replicas,
            image: Some(desired.image.clone()),
            limits: desired.limits,
            labels: desired.labels.clone(),
        }
    }
}

/// Health of a resource as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Degraded,
    Unknown,
}

/// Reconciliation lifecycle of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconcilePhase {
    /// Waiting for a worker.
    Pending,
    /// A worker is applying actions.
    InProgress,
    /// Observed state matches the reconciled generation.
    Converged,
    /// Reconciliation stopped on a failure.
    Degraded,
}

impl ReconcilePhase {
    /// Check if transition to target phase is valid.
    pub const fn can_transition_to(&self, target: Self) -> bool {
        use ReconcilePhase::{Converged, Degraded, InProgress, Pending};
        matches!(
            (self, target),
            (Pending, Pending | InProgress)
                | (InProgress, Converged | Degraded | Pending)
                | (Converged, Converged | Pending)
                | (Degraded, Degraded | Pending)
        )
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Converged => "Converged",
            Self::Degraded => "Degraded",
        };
        f.write_str(name)
    }
}

/// Why a resource ended up degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DegradedCause {
    /// The managed system rejected an action outright. Waits for a new generation.
    PermanentFailure,
    /// A finite transient retry budget ran out. Retried on the next periodic tick.
    RetriesExhausted,
}

/// Observed status of a resource. Written only by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub id: ResourceId,
    pub observed: ObservedAttributes,
    /// Last generation that reached convergence.
    pub observed_generation: u64,
    /// Last generation a reconcile was started for.
    pub attempted_generation: u64,
    pub health: Health,
    pub phase: ReconcilePhase,
    pub degraded_cause: Option<DegradedCause>,
    pub last_error: Option<String>,
    pub consecutive_poll_failures: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceStatus {
    /// A fresh status with nothing observed yet.
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            observed: ObservedAttributes::default(),
            observed_generation: 0,
            attempted_generation: 0,
            health: Health::Unknown,
            phase: ReconcilePhase::Pending,
            degraded_cause: None,
            last_error: None,
            consecutive_poll_failures: 0,
            last_polled_at: None,
            last_reconciled_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Replace the observed attributes.
    #[must_use]
    pub fn with_observed(mut self, observed: ObservedAttributes) -> Self {
        self.observed = observed;
        self
    }

    /// Whether this status records convergence of `generation`.
    pub fn is_converged_at(&self, generation: u64) -> bool {
        self.phase == ReconcilePhase::Converged && self.observed_generation == generation
    }

    /// Move to `target`, validating the transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when the lifecycle forbids the move.
    pub fn transition(&mut self, target: ReconcilePhase) -> Result<(), Error> {
        if !self.phase.can_transition_to(target) {
            return Err(Error::invalid_transition(self.phase, target));
        }
        self.phase = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Why a reconcile was requested. Ordered by dequeue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskReason {
    Periodic,
    ExternalDrift,
    SpecChanged,
}

impl fmt::Display for TaskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Periodic => "periodic",
            Self::ExternalDrift => "external-drift",
            Self::SpecChanged => "spec-changed",
        };
        f.write_str(name)
    }
}

/// A unit of reconcile work. Transient: created by the scheduler, consumed by a worker.
#[derive(Debug, Clone)]
pub struct ReconcileTask {
    pub task_id: Ulid,
    pub id: ResourceId,
    pub reason: TaskReason,
    pub enqueued_at: Instant,
}

impl ReconcileTask {
    pub fn new(id: ResourceId, reason: TaskReason) -> Self {
        Self {
            task_id: Ulid::new(),
            id,
            reason,
            enqueued_at: Instant::now(),
        }
    }

    /// Fold another trigger for the same resource into this task.
    ///
    /// Keeps the higher-priority reason and the earliest enqueue time.
    pub fn coalesce(&mut self, reason: TaskReason, enqueued_at: Instant) {
        self.reason = self.reason.max(reason);
        self.enqueued_at = self.enqueued_at.min(enqueued_at);
    }
}

/// Outcome of one corrective action against the managed system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionResult {
    Success,
    /// Retry with backoff.
    Transient(String),
    /// Report and stop retrying until the spec changes.
    Permanent(String),
}

impl ActionResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Metric label for the result class.
    pub const fn class(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_display_uses_lowercase_kind() {
        let id = ResourceId::new("shop", ResourceKind::StatefulSet, "db");
        assert_eq!(id.to_string(), "shop/statefulset/db");
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!(
            "Deployment".parse::<ResourceKind>().ok(),
            Some(ResourceKind::Deployment)
        );
        assert!("CronJob".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn kind_serializes_like_its_url_segment() {
        let json = serde_json::to_string(&ResourceKind::StatefulSet).ok();
        assert_eq!(json.as_deref(), Some("\"statefulset\""));

        let lower: Option<ResourceKind> = serde_json::from_str("\"daemonset\"").ok();
        let manifest: Option<ResourceKind> = serde_json::from_str("\"DaemonSet\"").ok();
        assert_eq!(lower, Some(ResourceKind::DaemonSet));
        assert_eq!(manifest, Some(ResourceKind::DaemonSet));
    }

    #[test]
    fn phase_transitions_follow_lifecycle() {
        use ReconcilePhase::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Converged));
        assert!(InProgress.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Pending));
        assert!(Converged.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Converged));
        assert!(!Degraded.can_transition_to(InProgress));
        assert!(!Converged.can_transition_to(Degraded));
    }

    #[test]
    fn status_transition_rejects_invalid_moves() {
        let mut status = ResourceStatus::new(ResourceId::deployment("ns", "web"));
        assert!(status.transition(ReconcilePhase::Converged).is_err());
        assert_eq!(status.phase, ReconcilePhase::Pending);
        assert!(status.transition(ReconcilePhase::InProgress).is_ok());
    }

    #[test]
    fn coalesce_keeps_highest_reason_and_earliest_time() {
        let id = ResourceId::deployment("ns", "web");
        let mut task = ReconcileTask::new(id, TaskReason::Periodic);
        let first = task.enqueued_at;

        task.coalesce(TaskReason::SpecChanged, first + Duration::from_secs(1));
        assert_eq!(task.reason, TaskReason::SpecChanged);
        assert_eq!(task.enqueued_at, first);

        task.coalesce(TaskReason::ExternalDrift, first);
        assert_eq!(task.reason, TaskReason::SpecChanged);
    }

    #[test]
    fn desired_defaults_are_enumerated() {
        let desired = DesiredAttributes::default();
        assert_eq!(desired.replicas, 1);
        assert!(desired.image.is_empty());
        assert_eq!(desired.limits, ResourceLimits::default());
        assert!(desired.labels.is_empty());
    }
}
