// ABOUTME: Cluster backend: a Deployment plus companion objects per descriptor.
// ABOUTME: API access goes through ClusterApi so tests can run against an in-memory cluster.

mod client;
pub mod manifest;

pub use client::KubeCluster;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use super::{
    AdapterError, ApplyReport, Capability, CapabilityPolicy, HealthDetails, HealthStatus,
    OrchestratorAdapter, OrchestratorKind, ReplicaCounts, Workload,
};
use crate::descriptor::{DeploymentDescriptor, WorkloadMode, label_constraint};
use crate::status::DeploymentStatus;
use crate::types::ServiceName;

pub const DEFAULT_NAMESPACE: &str = "default";

/// The object types this backend manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Deployment,
    Service,
    IngressRoute,
    Autoscaler,
    DisruptionBudget,
    NetworkPolicy,
}

impl ResourceKind {
    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps",
            ResourceKind::Service => "",
            ResourceKind::IngressRoute => "traefik.io",
            ResourceKind::Autoscaler => "autoscaling",
            ResourceKind::DisruptionBudget => "policy",
            ResourceKind::NetworkPolicy => "networking.k8s.io",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            ResourceKind::IngressRoute => "v1alpha1",
            ResourceKind::Autoscaler => "v2",
            _ => "v1",
        }
    }

    pub fn api_version(&self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            group => format!("{}/{}", group, self.version()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::IngressRoute => "IngressRoute",
            ResourceKind::Autoscaler => "HorizontalPodAutoscaler",
            ResourceKind::DisruptionBudget => "PodDisruptionBudget",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployments",
            ResourceKind::Service => "services",
            ResourceKind::IngressRoute => "ingressroutes",
            ResourceKind::Autoscaler => "horizontalpodautoscalers",
            ResourceKind::DisruptionBudget => "poddisruptionbudgets",
            ResourceKind::NetworkPolicy => "networkpolicies",
        }
    }

    /// Name of this workload's object of this kind. Network policies are user-named
    /// and found by label instead.
    pub fn object_name(&self, service: &ServiceName) -> String {
        match self {
            ResourceKind::IngressRoute => service.suffixed("ingress"),
            ResourceKind::Autoscaler => service.suffixed("hpa"),
            ResourceKind::DisruptionBudget => service.suffixed("pdb"),
            _ => service.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub version: Option<String>,
    pub ready_nodes: u32,
    pub total_nodes: u32,
    pub endpoint: Option<String>,
}

/// The API calls the cluster adapter needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn cluster_info(&self) -> Result<ClusterInfo, AdapterError>;

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AdapterError>;

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, AdapterError>;

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<(), AdapterError>;

    /// Replace an existing object. The manifest carries the current resourceVersion.
    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        manifest: &Value,
    ) -> Result<(), AdapterError>;

    /// Returns false when the object did not exist.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, AdapterError>;

    /// Objects of `kind` matching a label selector such as `app=web`.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Used when a descriptor names no namespace.
    pub namespace: String,
    pub capabilities: CapabilityPolicy,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            capabilities: CapabilityPolicy::default(),
        }
    }
}

pub struct ClusterAdapter {
    api: Arc<dyn ClusterApi>,
    settings: ClusterSettings,
}

fn object_name(object: &Value) -> Option<&str> {
    object["metadata"]["name"].as_str()
}

fn count(value: &Value) -> u32 {
    value
        .as_u64()
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Map a Deployment's status block onto the shared status vocabulary.
pub fn rollout_status(deployment: &Value) -> DeploymentStatus {
    let status = &deployment["status"];
    let stalled = status["conditions"].as_array().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|c| c["type"] == "Progressing" && c["reason"] == "ProgressDeadlineExceeded")
    });
    if stalled {
        return DeploymentStatus::Failed;
    }

    let desired = count(&deployment["spec"]["replicas"]);
    let generation = deployment["metadata"]["generation"].as_u64();
    let observed = status["observedGeneration"].as_u64();
    if let (Some(generation), Some(observed)) = (generation, observed)
        && observed < generation
    {
        return DeploymentStatus::Updating;
    }
    if desired == 0 {
        return DeploymentStatus::Running;
    }
    if count(&status["updatedReplicas"]) < desired {
        return DeploymentStatus::Updating;
    }
    match count(&status["availableReplicas"]) {
        0 => DeploymentStatus::Pending,
        available if available < desired => DeploymentStatus::Scaling,
        _ => DeploymentStatus::Running,
    }
}

fn conditions(deployment: &Value) -> Vec<String> {
    deployment["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .map(|c| {
                    let mut line = format!(
                        "{}={}",
                        c["type"].as_str().unwrap_or("Unknown"),
                        c["status"].as_str().unwrap_or("Unknown")
                    );
                    if let Some(reason) = c["reason"].as_str() {
                        line.push_str(&format!(" ({})", reason));
                    }
                    line
                })
                .collect()
        })
        .unwrap_or_default()
}

impl ClusterAdapter {
    pub fn new(api: Arc<dyn ClusterApi>, settings: ClusterSettings) -> Self {
        Self { api, settings }
    }

    fn namespace<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested.unwrap_or(&self.settings.namespace)
    }

    fn owner_selector(name: &str) -> String {
        format!("app={},{}=true", name, super::MANAGED_LABEL)
    }

    async fn upsert(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        mut manifest: Value,
    ) -> Result<(), AdapterError> {
        match self.api.get(kind, namespace, name).await? {
            Some(existing) => {
                manifest["metadata"]["resourceVersion"] =
                    existing["metadata"]["resourceVersion"].clone();
                if kind == ResourceKind::Service
                    && let Some(ip) = existing["spec"].get("clusterIP")
                {
                    manifest["spec"]["clusterIP"] = ip.clone();
                }
                tracing::debug!("Replacing {} {}/{}", kind.kind(), namespace, name);
                self.api.replace(kind, namespace, name, &manifest).await
            }
            None => {
                tracing::debug!("Creating {} {}/{}", kind.kind(), namespace, name);
                self.api.create(kind, namespace, &manifest).await
            }
        }
    }

    async fn prune(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), AdapterError> {
        if self.api.delete(kind, namespace, name).await? {
            tracing::info!("Deleted {} {}/{} no longer declared", kind.kind(), namespace, name);
        }
        Ok(())
    }

    /// Network policies carrying this workload's owner labels, as (namespace, name).
    async fn owned_policies(
        &self,
        service: &str,
        namespaces: &[&str],
    ) -> Result<Vec<(String, String)>, AdapterError> {
        let selector = Self::owner_selector(service);
        let mut found = Vec::new();
        for namespace in namespaces {
            for object in self
                .api
                .list(ResourceKind::NetworkPolicy, namespace, &selector)
                .await?
            {
                if let Some(name) = object_name(&object) {
                    found.push((namespace.to_string(), name.to_string()));
                }
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn sync_network_policy(
        &self,
        descriptor: &DeploymentDescriptor,
        namespace: &str,
    ) -> Result<(), AdapterError> {
        let declared = descriptor.network_policy.as_ref().map(|policy| {
            (
                manifest::policy_namespace(policy, namespace).to_string(),
                policy.name.clone(),
            )
        });

        let mut namespaces = vec![namespace];
        if let Some((policy_ns, _)) = &declared {
            namespaces.push(policy_ns);
        }
        for (ns, name) in self.owned_policies(descriptor.name.as_str(), &namespaces).await? {
            if declared.as_ref() != Some(&(ns.clone(), name.clone())) {
                self.prune(ResourceKind::NetworkPolicy, &ns, &name).await?;
            }
        }

        if let (Some((policy_ns, name)), Some(object)) =
            (&declared, manifest::network_policy(descriptor, namespace))
        {
            self.upsert(ResourceKind::NetworkPolicy, policy_ns, name, object)
                .await?;
        }
        Ok(())
    }
}

type Builder = fn(&DeploymentDescriptor, &str) -> Option<Value>;

const COMPANIONS: [(ResourceKind, Builder); 4] = [
    (ResourceKind::Service, manifest::service),
    (ResourceKind::IngressRoute, manifest::ingress_route),
    (ResourceKind::Autoscaler, manifest::autoscaler),
    (ResourceKind::DisruptionBudget, manifest::disruption_budget),
];

#[async_trait]
impl OrchestratorAdapter for ClusterAdapter {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Cluster
    }

    fn capability_policy(&self) -> CapabilityPolicy {
        self.settings.capabilities
    }

    fn capability_gaps(&self, descriptor: &DeploymentDescriptor) -> Vec<Capability> {
        let mut gaps = Vec::new();
        if descriptor.mode == WorkloadMode::Global {
            gaps.push(Capability::GlobalMode);
        }
        let placement = &descriptor.placement;
        for constraint in &placement.constraints {
            if label_constraint(constraint).is_none() {
                gaps.push(Capability::PlacementConstraint(constraint.clone()));
            }
        }
        if placement.platforms.len() > 1 {
            gaps.push(Capability::PlacementConstraint(format!(
                "{} alternative platforms",
                placement.platforms.len()
            )));
        }
        if let Some(max) = placement.max_replicas_per_node {
            gaps.push(Capability::PlacementConstraint(format!(
                "at most {} replicas per node",
                max
            )));
        }
        for preference in &placement.preferences {
            gaps.push(Capability::SpreadPreference(preference.clone()));
        }
        gaps
    }

    async fn apply(&self, descriptor: &DeploymentDescriptor) -> Result<ApplyReport, AdapterError> {
        let ignored = self.preflight(descriptor)?;
        let namespace = self.namespace(descriptor.namespace.as_deref());

        self.api.ensure_namespace(namespace).await?;
        self.upsert(
            ResourceKind::Deployment,
            namespace,
            descriptor.name.as_str(),
            manifest::deployment(descriptor, namespace),
        )
        .await?;

        for (kind, build) in COMPANIONS {
            let name = kind.object_name(&descriptor.name);
            match build(descriptor, namespace) {
                Some(object) => self.upsert(kind, namespace, &name, object).await?,
                None => self.prune(kind, namespace, &name).await?,
            }
        }
        self.sync_network_policy(descriptor, namespace).await?;

        Ok(ApplyReport { ignored })
    }

    async fn remove(&self, name: &ServiceName, namespace: Option<&str>) -> Result<(), AdapterError> {
        let namespace = self.namespace(namespace);

        for kind in [ResourceKind::Autoscaler, ResourceKind::DisruptionBudget] {
            self.prune(kind, namespace, &kind.object_name(name)).await?;
        }
        for (ns, policy) in self.owned_policies(name.as_str(), &[namespace]).await? {
            self.prune(ResourceKind::NetworkPolicy, &ns, &policy).await?;
        }
        for kind in [
            ResourceKind::IngressRoute,
            ResourceKind::Service,
            ResourceKind::Deployment,
        ] {
            self.prune(kind, namespace, &kind.object_name(name)).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let info = match self.api.cluster_info().await {
            Ok(info) => info,
            Err(e) => return HealthStatus::unreachable(format!("failed to reach cluster: {}", e)),
        };
        let healthy = info.ready_nodes >= 1;
        HealthStatus {
            healthy,
            message: if healthy {
                format!(
                    "cluster is healthy ({}/{} nodes ready)",
                    info.ready_nodes, info.total_nodes
                )
            } else {
                "cluster has no ready nodes".to_string()
            },
            details: Some(HealthDetails {
                version: info.version,
                nodes: Some(info.ready_nodes),
                api_endpoint: info.endpoint,
                last_check: Utc::now(),
            }),
        }
    }

    async fn describe(
        &self,
        name: &ServiceName,
        namespace: Option<&str>,
    ) -> Result<Option<Workload>, AdapterError> {
        let namespace = self.namespace(namespace);
        let Some(deployment) = self
            .api
            .get(ResourceKind::Deployment, namespace, name.as_str())
            .await?
        else {
            return Ok(None);
        };

        let autoscaler = self
            .api
            .get(
                ResourceKind::Autoscaler,
                namespace,
                &ResourceKind::Autoscaler.object_name(name),
            )
            .await?;
        let mut resource_count = 1 + usize::from(autoscaler.is_some());
        for kind in [
            ResourceKind::Service,
            ResourceKind::IngressRoute,
            ResourceKind::DisruptionBudget,
        ] {
            if self
                .api
                .get(kind, namespace, &kind.object_name(name))
                .await?
                .is_some()
            {
                resource_count += 1;
            }
        }
        resource_count += self.owned_policies(name.as_str(), &[namespace]).await?.len();

        let status = &deployment["status"];
        let desired = count(&deployment["spec"]["replicas"]);
        let available = count(&status["availableReplicas"]);
        Ok(Some(Workload {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            status: rollout_status(&deployment),
            replicas: ReplicaCounts {
                desired,
                ready: count(&status["readyReplicas"]),
                available,
                unavailable: status["unavailableReplicas"]
                    .as_u64()
                    .map_or(desired.saturating_sub(available), |n| {
                        u32::try_from(n).unwrap_or(u32::MAX)
                    }),
            },
            image: deployment["spec"]["template"]["spec"]["containers"][0]["image"]
                .as_str()
                .map(String::from),
            autoscaling: autoscaler.map(|hpa| {
                (
                    count(&hpa["spec"]["minReplicas"]).max(1),
                    count(&hpa["spec"]["maxReplicas"]),
                )
            }),
            resource_count,
            conditions: conditions(&deployment),
        }))
    }
}
