//! Error types for the reconciler crate.

use thiserror::Error;

use crate::types::ReconcilePhase;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Transient action errors never reach callers: the retry loop absorbs them.
/// Permanent action errors surface through the resource status only.
#[derive(Debug, Error)]
pub enum Error {
    /// A submitted spec was rejected. Not retried.
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// An action failed in a way worth retrying.
    #[error("action '{action}' failed transiently: {reason}")]
    TransientAction { action: String, reason: String },

    /// An action was rejected by the managed system.
    #[error("action '{action}' failed permanently: {reason}")]
    PermanentAction { action: String, reason: String },

    /// Polling failed too many times in a row; status is last-known only.
    #[error("status of '{id}' is stale after {failures} consecutive poll failures")]
    TrackerStale { id: String, failures: u32 },

    /// Phase change not allowed by the lifecycle.
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition {
        from: ReconcilePhase,
        to: ReconcilePhase,
    },

    /// Resource is not managed by this controller.
    #[error("resource '{id}' not found")]
    ResourceNotFound { id: String },

    /// Loop was stopped.
    #[error("reconciliation loop stopped")]
    LoopStopped,

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Core(#[from] keel_core::Error),
}

impl Error {
    /// Create a validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a permanent action error.
    pub fn permanent_action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermanentAction {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient action error.
    pub fn transient_action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientAction {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create a tracker stale error.
    pub fn tracker_stale(id: impl ToString, failures: u32) -> Self {
        Self::TrackerStale {
            id: id.to_string(),
            failures,
        }
    }

    /// Create an invalid transition error.
    pub const fn invalid_transition(from: ReconcilePhase, to: ReconcilePhase) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Create a resource not found error.
    pub fn resource_not_found(id: impl ToString) -> Self {
        Self::ResourceNotFound { id: id.to_string() }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the error came from caller input rather than the system.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = Error::validation("image", "must not be empty");
        assert_eq!(err.to_string(), "invalid image: must not be empty");
        assert!(err.is_validation());
    }

    #[test]
    fn test_action_failed() {
        let err = Error::permanent_action("set-image", "image pull denied");
        assert!(err.to_string().contains("set-image"));
        assert!(err.to_string().contains("image pull denied"));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_invalid_transition_names_phases() {
        let err = Error::invalid_transition(ReconcilePhase::Degraded, ReconcilePhase::Converged);
        assert_eq!(
            err.to_string(),
            "invalid phase transition Degraded -> Converged"
        );
    }
}
