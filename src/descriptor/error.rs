// ABOUTME: Validation errors for deployment descriptors.
// ABOUTME: Raised before a descriptor is handed to the pipeline or an adapter.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("autoscaling min_replicas ({min}) exceeds max_replicas ({max})")]
    AutoscalingBounds { min: u32, max: u32 },

    #[error("autoscaling requires target_cpu or target_memory")]
    AutoscalingTarget,

    #[error("autoscaling target '{0}' must be between 1 and 100 percent")]
    AutoscalingPercent(u32),

    #[error("probe failure_threshold must be at least 1")]
    ProbeThreshold,

    #[error("probe period must be non-zero")]
    ProbePeriod,

    #[error("ambiguous probe: exactly one of http, tcp or exec must be set (found {0})")]
    AmbiguousProbe(usize),

    #[error("exec probe needs a command")]
    EmptyExecProbe,

    #[error("mount path must be absolute: {0}")]
    RelativeMountPath(String),

    #[error("volume '{0}' cannot declare both a claim and a host path")]
    VolumeSource(String),

    #[error("resource {field} cannot be empty")]
    EmptyQuantity { field: &'static str },

    #[error("duplicate container port {0}")]
    DuplicatePort(u16),

    #[error("pod disruption budget needs min_available or max_unavailable, not both")]
    DisruptionBudget,

    #[error("invalid value '{0}': expected an integer or a percentage like 25%")]
    IntOrPercent(String),

    #[error("global mode cannot be combined with autoscaling")]
    GlobalAutoscaling,

    #[error("{replicas} replicas is outside the autoscaling range {min}-{max}")]
    ReplicasOutsideAutoscaling { replicas: u32, min: u32, max: u32 },
}
