//! Corrective actions the reconciler issues against the managed system.
//!
//! Every action has "set to value" semantics, so issuing it twice has the
//! same effect as issuing it once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{LimitKind, ObservedAttributes};

/// Whether an action can remove capacity or configuration.
///
/// Additive actions sort before destructive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Safety {
    Additive,
    Destructive,
}

/// A minimal, idempotent unit of change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Roll the workload to a new image.
    SetImage { image: String },
    /// Set a resource limit.
    SetLimit { kind: LimitKind, value: u32 },
    /// Set a label.
    SetLabel { key: String, value: String },
    /// Scale from the observed count to the desired count.
    SetReplicas { from: u32, to: u32 },
    /// Drop a label no longer desired.
    RemoveLabel { key: String },
    /// Drop a resource limit no longer desired.
    RemoveLimit { kind: LimitKind },
}

impl Action {
    /// Safety class of the action.
    pub const fn safety(&self) -> Safety {
        match self {
            Self::SetImage { .. } | Self::SetLimit { .. } | Self::SetLabel { .. } => {
                Safety::Additive
            }
            Self::SetReplicas { from, to } => {
                if *to < *from {
                    Safety::Destructive
                } else {
                    Safety::Additive
                }
            }
            Self::RemoveLabel { .. } | Self::RemoveLimit { .. } => Safety::Destructive,
        }
    }

    /// Fixed declared priority within a safety class. Lower runs first.
    pub const fn priority(&self) -> u8 {
        match self {
            Self::SetImage { .. } => 0,
            Self::SetLimit { .. } => 1,
            Self::SetLabel { .. } => 2,
            Self::SetReplicas { .. } => 3,
            Self::RemoveLabel { .. } => 4,
            Self::RemoveLimit { .. } => 5,
        }
    }

    /// Short stable name, used as a metric label.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetImage { .. } => "set-image",
            Self::SetLimit { .. } => "set-limit",
            Self::SetLabel { .. } => "set-label",
            Self::SetReplicas { .. } => "set-replicas",
            Self::RemoveLabel { .. } => "remove-label",
            Self::RemoveLimit { .. } => "remove-limit",
        }
    }

    /// Total ordering key: safety, then priority, then the action's subject.
    pub fn ordering_key(&self) -> (Safety, u8, String) {
        let subject = match self {
            Self::SetLabel { key, .. } | Self::RemoveLabel { key } => key.clone(),
            Self::SetLimit { kind, .. } | Self::RemoveLimit { kind } => kind.as_str().to_string(),
            Self::SetImage { .. } | Self::SetReplicas { .. } => String::new(),
        };
        (self.safety(), self.priority(), subject)
    }

    /// Effect of a successful action on the observed attributes.
    pub fn apply_to(&self, observed: &mut ObservedAttributes) {
        match self {
            Self::SetImage { image } => observed.image = Some(image.clone()),
            Self::SetLimit { kind, value } => observed.limits.set(*kind, Some(*value)),
            Self::SetLabel { key, value } => {
                observed.labels.insert(key.clone(), value.clone());
            }
            Self::SetReplicas { to, .. } => observed.replicas = *to,
            Self::RemoveLabel { key } => {
                observed.labels.remove(key);
            }
            Self::RemoveLimit { kind } => observed.limits.set(*kind, None),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetImage { image } => write!(f, "set image to {image}"),
            Self::SetLimit { kind, value } => write!(f, "set {kind} limit to {value}"),
            Self::SetLabel { key, value } => write!(f, "set label {key}={value}"),
            Self::SetReplicas { from, to } => write!(f, "scale {from} -> {to} replicas"),
            Self::RemoveLabel { key } => write!(f, "remove label {key}"),
            Self::RemoveLimit { kind } => write!(f, "remove {kind} limit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_down_is_destructive() {
        assert_eq!(
            Action::SetReplicas { from: 5, to: 2 }.safety(),
            Safety::Destructive
        );
        assert_eq!(
            Action::SetReplicas { from: 2, to: 5 }.safety(),
            Safety::Additive
        );
    }

    #[test]
    fn apply_to_is_idempotent() {
        let action = Action::SetLabel {
            key: "tier".into(),
            value: "web".into(),
        };
        let mut once = ObservedAttributes::default();
        action.apply_to(&mut once);
        let mut twice = once.clone();
        action.apply_to(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn action_description() {
        let action = Action::SetReplicas { from: 0, to: 3 };
        assert_eq!(action.to_string(), "scale 0 -> 3 replicas");
        assert_eq!(action.name(), "set-replicas");
    }

    #[test]
    fn serializes_with_action_tag() {
        let json = serde_json::to_value(Action::RemoveLimit {
            kind: LimitKind::Memory,
        });
        assert_eq!(
            json.ok(),
            Some(serde_json::json!({"action": "remove_limit", "kind": "memory"}))
        );
    }
}
