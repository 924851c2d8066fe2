// ABOUTME: Errors from status transitions and the status store.
// ABOUTME: Illegal transitions and run-ownership violations are reported, never applied.

use thiserror::Error;

use super::DeploymentStatus;
use crate::types::{RunId, ServiceName};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("illegal transition for {service}: {from} -> {to}")]
    InvalidTransition {
        service: ServiceName,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("no status record for {0}")]
    NotFound(ServiceName),

    /// A live run still owns the record.
    #[error("{service} is {status} under run {}", .run.as_ref().map_or("unknown", |r| r.as_str()))]
    InFlight {
        service: ServiceName,
        status: DeploymentStatus,
        run: Option<RunId>,
    },

    #[error("run {run} does not own the status of {service}")]
    NotOwner { service: ServiceName, run: RunId },

    #[error("status store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed status record: {0}")]
    Json(#[from] serde_json::Error),
}
