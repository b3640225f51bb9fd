//! Desired-state store.
//!
//! Holds the latest accepted spec per resource, assigns generations and
//! announces every accepted edit on a broadcast channel.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{ResourceId, ResourceSpec};

/// Capacity of the change broadcast. Slow listeners resync on lag.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Longest allowed name or namespace.
const MAX_NAME_LEN: usize = 63;

/// Notification that a resource's desired state changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecChange {
    pub id: ResourceId,
    pub generation: u64,
}

struct StoredSpec {
    spec: ResourceSpec,
    generation_tx: watch::Sender<u64>,
}

/// Thread-safe store of desired state.
pub struct DesiredStateStore {
    specs: RwLock<HashMap<ResourceId, StoredSpec>>,
    changes: broadcast::Sender<SpecChange>,
}

impl Default for DesiredStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DesiredStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            specs: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Validate and accept a spec.
    ///
    /// The store assigns the generation: 1 for a new resource, previous + 1
    /// for an edit. Submitting the same desired state again is not an edit
    /// and returns the stored spec unchanged without a notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when a required field is missing or malformed.
    pub async fn submit(&self, mut spec: ResourceSpec) -> Result<ResourceSpec> {
        validate_spec(&spec)?;

        let mut specs = self.specs.write().await;

        let generation = match specs.get(&spec.id) {
            Some(stored) if stored.spec.same_desired_state(&spec) => {
                debug!(id = %spec.id, generation = stored.spec.generation, "Unchanged spec resubmitted");
                return Ok(stored.spec.clone());
            }
            Some(stored) => stored.spec.generation.saturating_add(1),
            None => 1,
        };
        spec.generation = generation;

        match specs.get_mut(&spec.id) {
            Some(stored) => {
                stored.spec = spec.clone();
                stored.generation_tx.send_replace(generation);
            }
            None => {
                let (generation_tx, _) = watch::channel(generation);
                specs.insert(
                    spec.id.clone(),
                    StoredSpec {
                        spec: spec.clone(),
                        generation_tx,
                    },
                );
            }
        }
        drop(specs);

        info!(id = %spec.id, generation, "Accepted spec");

        // No receivers is fine: nothing is running yet.
        let _ = self.changes.send(SpecChange {
            id: spec.id.clone(),
            generation,
        });

        Ok(spec)
    }

    /// Get the latest accepted spec.
    pub async fn get(&self, id: &ResourceId) -> Option<ResourceSpec> {
        self.specs.read().await.get(id).map(|s| s.spec.clone())
    }

    /// All specs, ordered by id.
    pub async fn list(&self) -> Vec<ResourceSpec> {
        let mut specs: Vec<ResourceSpec> = self
            .specs
            .read()
            .await
            .values()
            .map(|s| s.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// All managed ids, ordered.
    pub async fn ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.specs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop managing a resource. Returns the last spec if it was present.
    ///
    /// Dropping the generation channel signals in-flight reconciles.
    pub async fn remove(&self, id: &ResourceId) -> Option<ResourceSpec> {
        let removed = self.specs.write().await.remove(id).map(|s| s.spec);
        if removed.is_some() {
            info!(id = %id, "Removed spec");
        }
        removed
    }

    /// Receiver tracking the latest generation of `id`.
    pub async fn watch_generation(&self, id: &ResourceId) -> Option<watch::Receiver<u64>> {
        self.specs
            .read()
            .await
            .get(id)
            .map(|s| s.generation_tx.subscribe())
    }

    /// Subscribe to accepted edits.
    pub fn subscribe(&self) -> broadcast::Receiver<SpecChange> {
        self.changes.subscribe()
    }

    /// Number of managed resources.
    pub async fn len(&self) -> usize {
        self.specs.read().await.len()
    }

    /// Whether no resources are managed.
    pub async fn is_empty(&self) -> bool {
        self.specs.read().await.is_empty()
    }
}

/// Check every required field of a spec.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the offending field.
pub fn validate_spec(spec: &ResourceSpec) -> Result<()> {
    validate_name("namespace", &spec.id.namespace)?;
    validate_name("name", &spec.id.name)?;

    let image = &spec.attributes.image;
    if image.is_empty() {
        return Err(Error::validation("image", "must not be empty"));
    }
    if image.chars().any(char::is_whitespace) {
        return Err(Error::validation("image", "must not contain whitespace"));
    }

    if spec.attributes.limits.cpu_millis == Some(0) {
        return Err(Error::validation("limits.cpu", "must be greater than zero"));
    }
    if spec.attributes.limits.memory_mib == Some(0) {
        return Err(Error::validation("limits.memory", "must be greater than zero"));
    }

    if let Some(key) = spec.attributes.labels.keys().find(|k| k.trim().is_empty()) {
        return Err(Error::validation("labels", format!("invalid label key '{key}'")));
    }

    if spec.poll_interval.is_some_and(|d| d.is_zero()) {
        return Err(Error::validation("poll_interval", "must be non-zero"));
    }

    Ok(())
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(Error::validation(
            field,
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation(
            field,
            format!("'{value}' may only contain lowercase letters, digits and '-'"),
        ));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(Error::validation(
            field,
            format!("'{value}' must start and end with an alphanumeric character"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DesiredAttributes;

    fn web(replicas: u32) -> ResourceSpec {
        ResourceSpec::new(
            ResourceId::deployment("shop", "web"),
            DesiredAttributes::with_image("web:1").replicas(replicas),
        )
    }

    #[tokio::test]
    async fn first_submission_gets_generation_one() {
        let store = DesiredStateStore::new();
        let accepted = store.submit(web(3)).await;
        assert_eq!(accepted.ok().map(|s| s.generation), Some(1));
    }

    #[tokio::test]
    async fn edits_bump_generation_and_notify() {
        let store = DesiredStateStore::new();
        let mut changes = store.subscribe();

        let _ = store.submit(web(1)).await;
        let second = store.submit(web(2)).await;
        assert_eq!(second.ok().map(|s| s.generation), Some(2));

        assert_eq!(changes.recv().await.ok().map(|c| c.generation), Some(1));
        assert_eq!(changes.recv().await.ok().map(|c| c.generation), Some(2));
    }

    #[tokio::test]
    async fn identical_resubmission_is_not_an_edit() {
        let store = DesiredStateStore::new();
        let _ = store.submit(web(3)).await;
        let mut changes = store.subscribe();

        let again = store.submit(web(3)).await;
        assert_eq!(again.ok().map(|s| s.generation), Some(1));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn caller_generation_is_ignored() {
        let store = DesiredStateStore::new();
        let mut spec = web(1);
        spec.generation = 42;
        assert_eq!(store.submit(spec).await.ok().map(|s| s.generation), Some(1));
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_and_not_stored() {
        let store = DesiredStateStore::new();
        let spec = ResourceSpec::new(
            ResourceId::deployment("shop", "web"),
            DesiredAttributes::default(),
        );
        let result = store.submit(spec).await;
        assert!(matches!(result, Err(Error::Validation { ref field, .. }) if field == "image"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn watch_generation_follows_edits() {
        let store = DesiredStateStore::new();
        let _ = store.submit(web(1)).await;
        let rx = store.watch_generation(&ResourceId::deployment("shop", "web")).await;
        let _ = store.submit(web(5)).await;
        assert_eq!(rx.map(|rx| *rx.borrow()), Some(2));
    }

    #[test]
    fn names_must_be_dns_labels() {
        assert!(validate_name("name", "web-1").is_ok());
        assert!(validate_name("name", "Web").is_err());
        assert!(validate_name("name", "-web").is_err());
        assert!(validate_name("name", "web_1").is_err());
        assert!(validate_name("name", &"a".repeat(64)).is_err());
    }
}
