//! Differ: desired vs observed.
//!
//! Pure and deterministic. The output order never depends on map iteration
//! or insertion order: actions are sorted by safety class (additive first),
//! then by a fixed priority per action type, then by subject.

use itertools::Itertools;

use crate::action::Action;
use crate::types::{DesiredAttributes, LimitKind, ObservedAttributes, ResourceSpec, ResourceStatus};

/// Compute the ordered actions that move `status` to `spec`.
///
/// A missing status is treated as the empty observed state.
pub fn diff(spec: &ResourceSpec, status: Option<&ResourceStatus>) -> Vec<Action> {
    match status {
        Some(status) => diff_attributes(&spec.attributes, &status.observed),
        None => diff_attributes(&spec.attributes, &ObservedAttributes::default()),
    }
}

/// Compute the ordered actions between two attribute sets.
pub fn diff_attributes(desired: &DesiredAttributes, observed: &ObservedAttributes) -> Vec<Action> {
    let mut actions = Vec::new();

    if observed.image.as_deref() != Some(desired.image.as_str()) {
        actions.push(Action::SetImage {
            image: desired.image.clone(),
        });
    }

    for kind in LimitKind::ALL {
        match (desired.limits.get(kind), observed.limits.get(kind)) {
            (Some(want), have) if have != Some(want) => {
                actions.push(Action::SetLimit { kind, value: want });
            }
            (None, Some(_)) => actions.push(Action::RemoveLimit { kind }),
            _ => {}
        }
    }

    for (key, value) in &desired.labels {
        if observed.labels.get(key) != Some(value) {
            actions.push(Action::SetLabel {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }

    for key in observed.labels.keys() {
        if !desired.labels.contains_key(key) {
            actions.push(Action::RemoveLabel { key: key.clone() });
        }
    }

    if observed.replicas != desired.replicas {
        actions.push(Action::SetReplicas {
            from: observed.replicas,
            to: desired.replicas,
        });
    }

    actions
        .into_iter()
        .sorted_by_cached_key(Action::ordering_key)
        .collect()
}
