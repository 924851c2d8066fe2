// ABOUTME: Deployment state machine and the per-service record it lives in.
// ABOUTME: The record outlives any single run and is read between runs.

mod error;
mod store;
mod tracker;

pub use error::StatusError;
pub use store::{FileStatusStore, MemoryStatusStore, StatusStore};
pub use tracker::{RunKind, StatusTracker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::descriptor::DeploymentDescriptor;
use crate::types::{RunId, ServiceName};

/// Service-level deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A new deploy against a service that already succeeded once.
    Updating,
    /// A replica-count change with no build.
    Scaling,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 6] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Running,
        DeploymentStatus::Succeeded,
        DeploymentStatus::Failed,
        DeploymentStatus::Updating,
        DeploymentStatus::Scaling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Updating => "updating",
            DeploymentStatus::Scaling => "scaling",
        }
    }

    /// Whether a run ends here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Succeeded | DeploymentStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Updating)
                | (Succeeded, Scaling)
                | (Updating, Succeeded)
                | (Updating, Failed)
                | (Scaling, Succeeded)
                | (Scaling, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preflight,
    Clone,
    Build,
    Apply,
    HealthWait,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Clone => "clone",
            Phase::Build => "build",
            Phase::Apply => "apply",
            Phase::HealthWait => "health_wait",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// None when the run failed before any phase began (e.g. cancelled in queue).
    pub phase: Option<Phase>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_tail: Vec<String>,
    pub at: DateTime<Utc>,
}

impl FailureReason {
    pub fn new(phase: Option<Phase>, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            log_tail: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn with_tail(mut self, tail: Vec<String>) -> Self {
        self.log_tail = tail;
        self
    }
}

/// Persisted deployment state of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service: ServiceName,
    pub status: DeploymentStatus,
    pub last_run_id: Option<RunId>,
    /// Descriptor of the most recent successful run; the rollback target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_descriptor: Option<DeploymentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// The successful descriptor before the last one; what a deliberate rollback
    /// returns to once the last one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_descriptor: Option<DeploymentDescriptor>,
    /// The last failed run re-applied the previous descriptor.
    #[serde(default)]
    pub rolled_back: bool,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(service: ServiceName, status: DeploymentStatus, run: RunId) -> Self {
        Self {
            service,
            status,
            last_run_id: Some(run),
            last_success_descriptor: None,
            previous_descriptor: None,
            failure: None,
            rolled_back: false,
            updated_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, run: &RunId) -> bool {
        self.last_run_id.as_ref() == Some(run)
    }

    /// What a deliberate rollback re-applies.
    ///
    /// After a failure that left the new descriptor in place this is the last
    /// successful one; otherwise the last successful one is what runs, and
    /// rollback returns to the one before it.
    pub fn rollback_target(&self) -> Option<&DeploymentDescriptor> {
        match self.status {
            DeploymentStatus::Failed if !self.rolled_back => self.last_success_descriptor.as_ref(),
            _ => self.previous_descriptor.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DeploymentStatus::Succeeded.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(!DeploymentStatus::Updating.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&DeploymentStatus::Updating).unwrap();
        assert_eq!(json, "\"updating\"");
        let phase = serde_json::to_string(&Phase::HealthWait).unwrap();
        assert_eq!(phase, "\"health_wait\"");
    }

    #[test]
    fn nothing_returns_to_pending_except_failed() {
        for status in DeploymentStatus::ALL {
            let allowed = status.can_transition_to(DeploymentStatus::Pending);
            assert_eq!(allowed, status == DeploymentStatus::Failed, "{status}");
        }
    }
}
