// ABOUTME: Application-wide error types for rollout.
// ABOUTME: Wraps module errors so the binary can report any of them with `?`.

use std::path::PathBuf;
use thiserror::Error;

use crate::descriptor::DescriptorError;
use crate::orchestrator::AdapterError;
use crate::pipeline::PipelineError;
use crate::status::StatusError;
use crate::types::ServiceName;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("environment variable {var} is not set (needed by {key})")]
    MissingEnvVar { key: String, var: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid service description: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("SSH error: {0}")]
    Ssh(#[from] crate::ssh::Error),

    /// A run started and ended in `failed`; details were already reported.
    #[error("run {run} for {service} failed")]
    RunFailed { service: ServiceName, run: String },

    #[error("control plane unhealthy: {0}")]
    Unhealthy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
