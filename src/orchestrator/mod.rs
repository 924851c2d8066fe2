// ABOUTME: The contract every orchestration backend implements.
// ABOUTME: Adapters translate descriptors into platform calls and platform state back into status.

mod connect;
mod error;
mod quantity;
pub mod cluster;
pub mod swarm;

pub use connect::{OrchestratorSettings, connect};
pub use error::{
    AdapterError, AdapterErrorKind, ApplySnafu, CapabilitySnafu, ConnectionSnafu, DescribeSnafu,
    QuantitySnafu, RemoveSnafu,
};
pub use quantity::{parse_cpu, parse_memory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::descriptor::DeploymentDescriptor;
use crate::status::DeploymentStatus;
use crate::types::{ImageRef, ServiceName};

/// Label attached to every object this tool creates.
pub const MANAGED_LABEL: &str = "rollout.managed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    Swarm,
    Cluster,
}

impl OrchestratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorKind::Swarm => "swarm",
            OrchestratorKind::Cluster => "cluster",
        }
    }
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A descriptor feature that a backend may have no way to express.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    Autoscaling,
    NetworkPolicy,
    ServiceAccount,
    DisruptionBudget,
    GlobalMode,
    PlacementConstraint(String),
    SpreadPreference(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Autoscaling => write!(f, "horizontal autoscaling"),
            Capability::NetworkPolicy => write!(f, "network policy"),
            Capability::ServiceAccount => write!(f, "service account"),
            Capability::DisruptionBudget => write!(f, "pod disruption budget"),
            Capability::GlobalMode => write!(f, "global mode"),
            Capability::PlacementConstraint(c) => write!(f, "placement constraint `{}`", c),
            Capability::SpreadPreference(p) => write!(f, "spread preference `{}`", p),
        }
    }
}

/// What to do when a descriptor asks for something the backend cannot express.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityPolicy {
    /// Fail before touching the platform.
    #[default]
    Reject,
    /// Apply without the feature and report it.
    Degrade,
}

/// Outcome of a successful `apply`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Features left out under `CapabilityPolicy::Degrade`.
    pub ignored: Vec<Capability>,
}

/// Control-plane reachability, independent of any workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    /// Absent on hard connectivity failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

impl HealthStatus {
    /// The control plane could not be reached at all.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaCounts {
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
    pub unavailable: u32,
}

/// A workload as the platform currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workload {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub status: DeploymentStatus,
    pub replicas: ReplicaCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Autoscaler bounds as (min, max).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<(u32, u32)>,
    /// Platform objects owned by this workload.
    pub resource_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

impl Workload {
    /// Rolled out and every desired replica ready.
    pub fn is_healthy(&self) -> bool {
        self.status == DeploymentStatus::Running && self.replicas.ready >= self.replicas.desired
    }

    /// Whether the platform's spec names `image`.
    ///
    /// Platforms may pin a digest onto a tag; that only counts when `image`
    /// names a digest itself.
    pub fn runs(&self, image: &ImageRef) -> bool {
        let Some(current) = self.image.as_deref().and_then(|i| ImageRef::parse(i).ok()) else {
            return false;
        };
        current.repository() == image.repository()
            && current.tag() == image.tag()
            && (image.digest().is_none() || current.digest() == image.digest())
    }
}

/// One orchestration backend.
#[async_trait]
pub trait OrchestratorAdapter: Send + Sync {
    fn kind(&self) -> OrchestratorKind;

    fn capability_policy(&self) -> CapabilityPolicy;

    /// Descriptor features this backend cannot express.
    fn capability_gaps(&self, descriptor: &DeploymentDescriptor) -> Vec<Capability>;

    /// Check a descriptor against the backend without any platform call.
    ///
    /// Returns the features that will be ignored under `Degrade`.
    fn preflight(&self, descriptor: &DeploymentDescriptor) -> Result<Vec<Capability>, AdapterError> {
        let gaps = self.capability_gaps(descriptor);
        if gaps.is_empty() {
            return Ok(gaps);
        }
        match self.capability_policy() {
            CapabilityPolicy::Reject => CapabilitySnafu {
                platform: self.kind(),
                gaps,
            }
            .fail(),
            CapabilityPolicy::Degrade => Ok(gaps),
        }
    }

    /// Create or update the workload. Repeating a call changes nothing.
    async fn apply(&self, descriptor: &DeploymentDescriptor) -> Result<ApplyReport, AdapterError>;

    /// Tear down everything owned by the workload. Absence is success.
    async fn remove(&self, name: &ServiceName, namespace: Option<&str>) -> Result<(), AdapterError>;

    async fn health_check(&self) -> HealthStatus;

    /// The workload's rollout state, or None when it does not exist.
    async fn describe(
        &self,
        name: &ServiceName,
        namespace: Option<&str>,
    ) -> Result<Option<Workload>, AdapterError>;
}
