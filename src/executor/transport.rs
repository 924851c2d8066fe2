// ABOUTME: Transport seam between the executor and the host a script runs on.
// ABOUTME: Local processes and SSH sessions both implement it.

use async_trait::async_trait;

use super::ExecError;
use crate::cancel::CancelToken;

/// Runs scripts on one host and gives access to their log files.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable host description for logs.
    fn describe(&self) -> String;

    /// Create the log file and its directory; returns the current length.
    async fn prepare_log(&self, path: &str) -> Result<u64, ExecError>;

    /// Run `script` to completion and return its exit code.
    ///
    /// When `cancel` fires the process tree is terminated and
    /// `ExecError::Cancelled` is returned.
    async fn run(&self, script: &str, log_path: &str, cancel: &CancelToken) -> Result<i32, ExecError>;

    /// Bytes appended to the log at or after `offset`.
    async fn read_log(&self, path: &str, offset: u64) -> Result<Vec<u8>, ExecError>;
}
