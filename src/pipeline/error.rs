// ABOUTME: Errors a pipeline run can end with, and the phase each belongs to.
// ABOUTME: Run failures are recorded on the service; request errors leave it untouched.

use std::time::Duration;
use thiserror::Error;

use super::locks::{LockError, LockInfo};
use crate::descriptor::DescriptorError;
use crate::executor::ExecError;
use crate::orchestrator::AdapterError;
use crate::status::{Phase, StatusError};
use crate::types::ServiceName;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A clone or build script exited non-zero.
    #[error("{phase} failed with exit code {exit_code}")]
    Build {
        phase: Phase,
        exit_code: i32,
        tail: Vec<String>,
    },

    #[error(transparent)]
    Capability(AdapterError),

    #[error("apply failed: {0}")]
    Apply(#[source] AdapterError),

    #[error("remove failed: {0}")]
    Remove(#[source] AdapterError),

    #[error("workload not healthy after {}s{}", .timeout.as_secs(), last_seen(.last))]
    HealthTimeout {
        timeout: Duration,
        last: Option<String>,
    },

    #[error("workload failed to roll out: {0}")]
    HealthFailed(String),

    #[error("{}", rejected(.service, .holder))]
    ConcurrencyRejected {
        service: ServiceName,
        holder: Option<LockInfo>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("{0} has no successful deployment")]
    NoSuccessfulDeployment(ServiceName),

    #[error("{0} has no earlier deployment to roll back to")]
    NoRollbackTarget(ServiceName),

    #[error("cannot scale: {0}")]
    InvalidScale(#[source] DescriptorError),

    #[error("could not take the service lock: {0}")]
    Lock(#[source] LockError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("{phase} could not run: {source}")]
    Exec {
        phase: Phase,
        #[source]
        source: ExecError,
    },
}

fn last_seen(last: &Option<String>) -> String {
    last.as_ref()
        .map(|l| format!(" (last seen: {})", l))
        .unwrap_or_default()
}

fn rejected(service: &ServiceName, holder: &Option<LockInfo>) -> String {
    match holder {
        Some(h) => format!(
            "{} is busy with run {} (started {} by {} pid {})",
            service,
            h.run_id,
            h.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            h.holder,
            h.pid
        ),
        None => format!("{} is busy with another run", service),
    }
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    Build,
    Capability,
    Apply,
    Remove,
    HealthTimeout,
    HealthFailed,
    ConcurrencyRejected,
    Cancelled,
    NoSuccessfulDeployment,
    NoRollbackTarget,
    InvalidScale,
    Lock,
    Status,
    Exec,
}

impl PipelineError {
    pub fn kind(&self) -> PipelineErrorKind {
        match self {
            PipelineError::Build { .. } => PipelineErrorKind::Build,
            PipelineError::Capability(_) => PipelineErrorKind::Capability,
            PipelineError::Apply(_) => PipelineErrorKind::Apply,
            PipelineError::Remove(_) => PipelineErrorKind::Remove,
            PipelineError::HealthTimeout { .. } => PipelineErrorKind::HealthTimeout,
            PipelineError::HealthFailed(_) => PipelineErrorKind::HealthFailed,
            PipelineError::ConcurrencyRejected { .. } => PipelineErrorKind::ConcurrencyRejected,
            PipelineError::Cancelled => PipelineErrorKind::Cancelled,
            PipelineError::NoSuccessfulDeployment(_) => PipelineErrorKind::NoSuccessfulDeployment,
            PipelineError::NoRollbackTarget(_) => PipelineErrorKind::NoRollbackTarget,
            PipelineError::InvalidScale(_) => PipelineErrorKind::InvalidScale,
            PipelineError::Lock(_) => PipelineErrorKind::Lock,
            PipelineError::Status(_) => PipelineErrorKind::Status,
            PipelineError::Exec { .. } => PipelineErrorKind::Exec,
        }
    }

    /// The run phase this error ended, when it belongs to one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            PipelineError::Build { phase, .. } | PipelineError::Exec { phase, .. } => Some(*phase),
            PipelineError::Capability(_) => Some(Phase::Preflight),
            PipelineError::Apply(_) => Some(Phase::Apply),
            PipelineError::HealthTimeout { .. } | PipelineError::HealthFailed(_) => {
                Some(Phase::HealthWait)
            }
            _ => None,
        }
    }

    /// Captured output of a failed script.
    pub fn tail(&self) -> &[String] {
        match self {
            PipelineError::Build { tail, .. } => tail,
            _ => &[],
        }
    }

    /// Whether the platform may have been changed by the failed run.
    pub fn touched_platform(&self) -> bool {
        matches!(self.phase(), Some(Phase::Apply | Phase::HealthWait))
    }
}
