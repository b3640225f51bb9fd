//! Controller metrics.
//!
//! Counters are plain atomics; per-action latency and per-resource health
//! sit behind a mutex. [`ControllerMetrics::snapshot`] produces a
//! serializable view for the HTTP API and the CLI.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ActionResult, Health, ResourceId};

/// Latency aggregate for one action kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl LatencyStats {
    fn record(&mut self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.count = self.count.saturating_add(1);
        self.total_ms = self.total_ms.saturating_add(ms);
        self.max_ms = self.max_ms.max(ms);
    }

    /// Mean latency in milliseconds, zero when nothing was recorded.
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct Histograms {
    latency: HashMap<&'static str, LatencyStats>,
    health: HashMap<ResourceId, Health>,
}

/// Live counters updated by the loop, reconciler and poller.
#[derive(Default)]
pub struct ControllerMetrics {
    queue_depth: AtomicU64,
    reconciles_started: AtomicU64,
    reconciles_converged: AtomicU64,
    reconciles_degraded: AtomicU64,
    reconciles_superseded: AtomicU64,
    actions_succeeded: AtomicU64,
    actions_transient: AtomicU64,
    actions_permanent: AtomicU64,
    poll_failures: AtomicU64,
    drift_detected: AtomicU64,
    histograms: Mutex<Histograms>,
}

/// Point-in-time copy of [`ControllerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub queue_depth: u64,
    pub reconciles_started: u64,
    pub reconciles_converged: u64,
    pub reconciles_degraded: u64,
    pub reconciles_superseded: u64,
    pub actions_succeeded: u64,
    pub actions_transient: u64,
    pub actions_permanent: u64,
    pub poll_failures: u64,
    pub drift_detected: u64,
    pub action_latency: BTreeMap<String, LatencyStats>,
    pub health: BTreeMap<String, usize>,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth
            .store(u64::try_from(depth).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn reconcile_started(&self) {
        self.reconciles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_converged(&self) {
        self.reconciles_converged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_degraded(&self) {
        self.reconciles_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_superseded(&self) {
        self.reconciles_superseded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an action result and record its latency under `action_name`.
    pub fn action_finished(&self, action_name: &'static str, result: &ActionResult, elapsed: Duration) {
        let counter = match result {
            ActionResult::Success => &self.actions_succeeded,
            ActionResult::Transient(_) => &self.actions_transient,
            ActionResult::Permanent(_) => &self.actions_permanent,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.histograms()
            .latency
            .entry(action_name)
            .or_default()
            .record(elapsed);
    }

    pub fn poll_failed(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drift_detected(&self) {
        self.drift_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_health(&self, id: &ResourceId, health: Health) {
        self.histograms().health.insert(id.clone(), health);
    }

    pub fn forget(&self, id: &ResourceId) {
        self.histograms().health.remove(id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histograms = self.histograms();
        let action_latency = histograms
            .latency
            .iter()
            .map(|(name, stats)| ((*name).to_string(), *stats))
            .collect();
        let mut health: BTreeMap<String, usize> = BTreeMap::new();
        for value in histograms.health.values() {
            let count = health.entry(health_label(*value).to_string()).or_default();
            *count = count.saturating_add(1);
        }
        drop(histograms);

        MetricsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            reconciles_started: self.reconciles_started.load(Ordering::Relaxed),
            reconciles_converged: self.reconciles_converged.load(Ordering::Relaxed),
            reconciles_degraded: self.reconciles_degraded.load(Ordering::Relaxed),
            reconciles_superseded: self.reconciles_superseded.load(Ordering::Relaxed),
            actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
            actions_transient: self.actions_transient.load(Ordering::Relaxed),
            actions_permanent: self.actions_permanent.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            drift_detected: self.drift_detected.load(Ordering::Relaxed),
            action_latency,
            health,
        }
    }

    fn histograms(&self) -> std::sync::MutexGuard<'_, Histograms> {
        self.histograms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const fn health_label(health: Health) -> &'static str {
    match health {
        Health::Healthy => "healthy",
        Health::Degraded => "degraded",
        Health::Unknown => "unknown",
    }
}
