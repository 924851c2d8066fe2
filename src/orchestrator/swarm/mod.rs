// ABOUTME: Swarm backend: one engine service per descriptor.
// ABOUTME: Engine access goes through SwarmApi so tests can run against an in-memory swarm.

mod docker;
pub mod spec;
mod translate;

pub use docker::{DOCKER_SOCKET, DockerSwarm};
pub use translate::service_spec;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use self::spec::ServiceSpec;
use super::{
    AdapterError, ApplyReport, Capability, CapabilityPolicy, HealthDetails, HealthStatus,
    OrchestratorAdapter, OrchestratorKind, ReplicaCounts, Workload,
};
use crate::descriptor::DeploymentDescriptor;
use crate::status::DeploymentStatus;
use crate::types::ServiceName;

pub const DEFAULT_NETWORK: &str = "rollout-network";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmInfo {
    /// `active` when this engine is a swarm member.
    pub local_node_state: String,
    pub nodes: Option<u32>,
    pub version: Option<String>,
}

/// An engine service as inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    /// Object version required for updates.
    pub version: u64,
    pub spec: ServiceSpec,
    /// Engine update status such as `updating` or `paused`.
    pub update_state: Option<String>,
}

/// The engine calls the swarm adapter needs.
#[async_trait]
pub trait SwarmApi: Send + Sync {
    async fn info(&self) -> Result<SwarmInfo, AdapterError>;

    async fn ensure_network(&self, name: &str) -> Result<(), AdapterError>;

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceState>, AdapterError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), AdapterError>;

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), AdapterError>;

    /// Returns false when the service did not exist.
    async fn remove_service(&self, name: &str) -> Result<bool, AdapterError>;

    /// Running tasks of the service created from the task template with
    /// this `ForceUpdate` generation.
    async fn running_tasks(&self, name: &str, generation: u64) -> Result<u32, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct SwarmSettings {
    /// Overlay network every service joins.
    pub network: String,
    pub capabilities: CapabilityPolicy,
    /// Shown in health details.
    pub endpoint: Option<String>,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            capabilities: CapabilityPolicy::default(),
            endpoint: None,
        }
    }
}

pub struct SwarmAdapter {
    api: Arc<dyn SwarmApi>,
    settings: SwarmSettings,
}

impl SwarmAdapter {
    pub fn new(api: Arc<dyn SwarmApi>, settings: SwarmSettings) -> Self {
        Self { api, settings }
    }
}

/// Map engine service state onto the shared status vocabulary.
///
/// Any engine rollback means the update we asked for was refused.
fn rollout_status(update_state: Option<&str>, desired: u32, running: u32) -> DeploymentStatus {
    match update_state {
        Some("paused") => return DeploymentStatus::Failed,
        Some(state) if state.starts_with("rollback_") => return DeploymentStatus::Failed,
        Some("updating") => return DeploymentStatus::Updating,
        _ => {}
    }
    if desired == 0 {
        DeploymentStatus::Running
    } else if running == 0 {
        DeploymentStatus::Pending
    } else if running < desired {
        DeploymentStatus::Scaling
    } else {
        DeploymentStatus::Running
    }
}

#[async_trait]
impl OrchestratorAdapter for SwarmAdapter {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Swarm
    }

    fn capability_policy(&self) -> CapabilityPolicy {
        self.settings.capabilities
    }

    fn capability_gaps(&self, descriptor: &DeploymentDescriptor) -> Vec<Capability> {
        let mut gaps = Vec::new();
        if descriptor.active_autoscaling().is_some() {
            gaps.push(Capability::Autoscaling);
        }
        if descriptor.network_policy.is_some() {
            gaps.push(Capability::NetworkPolicy);
        }
        if descriptor.service_account.is_some() {
            gaps.push(Capability::ServiceAccount);
        }
        if descriptor.pdb.is_some() {
            gaps.push(Capability::DisruptionBudget);
        }
        gaps
    }

    async fn apply(&self, descriptor: &DeploymentDescriptor) -> Result<ApplyReport, AdapterError> {
        let ignored = self.preflight(descriptor)?;
        let mut spec = service_spec(descriptor, &self.settings.network)?;
        let name = descriptor.name.as_str();

        self.api.ensure_network(&self.settings.network).await?;
        match self.api.inspect_service(name).await? {
            Some(existing) => {
                spec.task_template.force_update = existing.spec.task_template.force_update + 1;
                tracing::debug!("Updating swarm service {} (version {})", name, existing.version);
                self.api.update_service(name, existing.version, &spec).await?;
            }
            None => {
                tracing::debug!("Creating swarm service {}", name);
                self.api.create_service(&spec).await?;
            }
        }

        Ok(ApplyReport { ignored })
    }

    async fn remove(&self, name: &ServiceName, _namespace: Option<&str>) -> Result<(), AdapterError> {
        if !self.api.remove_service(name.as_str()).await? {
            tracing::debug!("Swarm service {} already absent", name);
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let info = match self.api.info().await {
            Ok(info) => info,
            Err(e) => return HealthStatus::unreachable(format!("failed to reach engine: {}", e)),
        };
        let healthy = info.local_node_state == "active";
        HealthStatus {
            healthy,
            message: if healthy {
                "swarm is healthy".to_string()
            } else {
                format!("swarm is not active (state: {})", info.local_node_state)
            },
            details: Some(HealthDetails {
                version: info.version,
                nodes: info.nodes,
                api_endpoint: self.settings.endpoint.clone(),
                last_check: Utc::now(),
            }),
        }
    }

    async fn describe(
        &self,
        name: &ServiceName,
        _namespace: Option<&str>,
    ) -> Result<Option<Workload>, AdapterError> {
        let Some(state) = self.api.inspect_service(name.as_str()).await? else {
            return Ok(None);
        };
        // Every apply bumps ForceUpdate, so older tasks never count.
        let running = self
            .api
            .running_tasks(name.as_str(), state.spec.task_template.force_update)
            .await?;
        let desired = state
            .spec
            .replicas()
            .map(|r| u32::try_from(r).unwrap_or(u32::MAX))
            .unwrap_or(running);

        Ok(Some(Workload {
            name: name.to_string(),
            namespace: None,
            status: rollout_status(state.update_state.as_deref(), desired, running),
            replicas: ReplicaCounts {
                desired,
                ready: running,
                available: running,
                unavailable: desired.saturating_sub(running),
            },
            image: Some(state.spec.task_template.container_spec.image.clone()),
            autoscaling: None,
            resource_count: 1,
            conditions: state.update_state.into_iter().collect(),
        }))
    }
}
