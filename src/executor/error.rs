// ABOUTME: Errors raised while running a composed script on a target.
// ABOUTME: Non-zero exits are not errors; they come back in the outcome.

use std::time::Duration;
use thiserror::Error;

use crate::types::HostId;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start script: {0}")]
    Spawn(String),

    #[error("no transport registered for host {0}")]
    UnknownHost(HostId),

    #[error("log file error: {0}")]
    Log(String),

    #[error("script timed out after {0:?}")]
    Timeout(Duration),

    #[error("script was cancelled")]
    Cancelled,

    #[error("SSH error: {0}")]
    Ssh(#[from] crate::ssh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// A failed log poll that the next tick may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecError::Ssh(e) => e.is_transport(),
            ExecError::Io(_) => true,
            _ => false,
        }
    }
}
