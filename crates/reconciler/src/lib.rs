//! Declarative reconciliation controller.
//!
//! Callers declare the desired state of a set of resources; the controller
//! continuously observes the managed system and applies the minimal ordered
//! set of idempotent actions that makes observed match desired.
//!
//! # Key Concepts
//!
//! - **Desired state**: [`DesiredStateStore`] holds the latest accepted
//!   [`ResourceSpec`] per resource and assigns generations.
//! - **Observed state**: [`ObservedStateTracker`] mirrors what the managed
//!   system reports, refreshed by the [`Poller`].
//! - **Diff**: [`diff()`] turns the gap into ordered [`Action`]s, additive
//!   before destructive.
//! - **Reconcile**: [`Reconciler`] applies actions with exponential backoff
//!   on transient failures and drives the phase machine
//!   `Pending -> InProgress -> {Converged, Degraded}`.
//! - **Loop**: [`ReconciliationLoop`] runs a worker pool over a coalescing
//!   [`WorkQueue`], fed by spec changes, drift and a periodic resync.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keel_reconciler::{
//!     Controller, ControllerConfig, DesiredAttributes, InMemoryCluster, ResourceId, ResourceSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> keel_reconciler::Result<()> {
//!     let controller = Controller::new(Arc::new(InMemoryCluster::new()), ControllerConfig::default())?;
//!     let running = controller.start();
//!
//!     controller
//!         .submit(ResourceSpec::new(
//!             ResourceId::deployment("shop", "web"),
//!             DesiredAttributes::with_image("web:1").replicas(3),
//!         ))
//!         .await?;
//!
//!     running.shutdown().await
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod action;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod r#loop;
pub mod metrics;
pub mod poller;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod system;
pub mod tracker;
pub mod types;

// Re-export main types
pub use action::{Action, Safety};
pub use backoff::BackoffPolicy;
pub use config::{ControllerConfig, PollConfig};
pub use controller::{Controller, RunningLoop};
pub use diff::{diff, diff_attributes};
pub use error::{Error, Result};
pub use metrics::{ControllerMetrics, LatencyStats, MetricsSnapshot};
pub use poller::{PollReport, Poller};
pub use queue::{EnqueueOutcome, WorkQueue};
pub use r#loop::{LoopStopper, ReconciliationLoop};
pub use reconciler::{ReconcileOutcome, Reconciler, SkipReason};
pub use store::{DesiredStateStore, SpecChange, validate_spec};
pub use system::{InMemoryCluster, ManagedSystem, PollError};
pub use tracker::{ObservedStateTracker, PollFailure};
pub use types::{
    ActionResult, DegradedCause, DesiredAttributes, Health, LimitKind, ObservedAttributes,
    ReconcilePhase, ReconcileTask, ResourceId, ResourceKind, ResourceLimits, ResourceSpec,
    ResourceStatus, TaskReason,
};
