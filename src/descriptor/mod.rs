// ABOUTME: Platform-agnostic description of a deployable workload.
// ABOUTME: Built fresh per deploy attempt, validated once, and never mutated in place.

mod autoscaling;
mod container;
mod error;
mod network_policy;
mod placement;
mod probe;
mod strategy;

pub use autoscaling::{HpaBehavior, HpaConfig, ScalingPolicy, ScalingPolicyKind, ScalingRules};
pub use container::{Port, Protocol, PublishMode, ResourceRequirements, ResourceSet, Volume};
pub use error::DescriptorError;
pub use network_policy::{
    IpBlock, NetworkPolicyConfig, NetworkPolicyPeer, NetworkPolicyRule, PolicyPort, PolicyType,
    PortRef,
};
pub use placement::{LabelConstraint, PdbConfig, Placement, Platform, WorkloadMode, label_constraint};
pub use probe::{HttpScheme, ProbeCheck, ProbeConfig};
pub use strategy::{IntOrPercent, RolloutStrategy};

use crate::types::{ImageRef, ServiceName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Everything an orchestrator needs to run one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub name: ServiceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub image: ImageRef,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RolloutStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<HpaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdb: Option<PdbConfig>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub mode: WorkloadMode,
}

fn default_replicas() -> u32 {
    1
}

impl DeploymentDescriptor {
    pub fn builder(name: ServiceName, image: ImageRef) -> DescriptorBuilder {
        DescriptorBuilder::new(name, image)
    }

    /// Check cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if let Some(hpa) = &self.autoscaling {
            hpa.validate()?;
            if hpa.enabled && self.mode == WorkloadMode::Global {
                return Err(DescriptorError::GlobalAutoscaling);
            }
        }
        if let Some(probe) = &self.probe {
            probe.validate()?;
        }
        for volume in &self.volumes {
            volume.validate()?;
        }
        self.resources.validate()?;

        let mut seen = BTreeSet::new();
        for port in &self.ports {
            if !seen.insert((port.container_port, port.protocol.as_str())) {
                return Err(DescriptorError::DuplicatePort(port.container_port));
            }
        }

        if let Some(pdb) = &self.pdb
            && pdb.min_available.is_some() == pdb.max_unavailable.is_some()
        {
            return Err(DescriptorError::DisruptionBudget);
        }
        Ok(())
    }

    /// The autoscaling policy, if present and switched on.
    pub fn active_autoscaling(&self) -> Option<&HpaConfig> {
        self.autoscaling.as_ref().filter(|hpa| hpa.enabled)
    }

    /// Labels that identify this workload's replicas.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.name.to_string())])
    }

    /// Copy of this descriptor with a different replica count.
    pub fn with_replicas(&self, replicas: u32) -> Self {
        Self {
            replicas,
            ..self.clone()
        }
    }

    /// Copy of this descriptor at `replicas`, checked as a deploy would be.
    ///
    /// An active autoscaler owns the replica count, so the new count must sit
    /// inside its bounds.
    pub fn scaled(&self, replicas: u32) -> Result<Self, DescriptorError> {
        if let Some(hpa) = self.active_autoscaling()
            && hpa.clamp(replicas) != replicas
        {
            return Err(DescriptorError::ReplicasOutsideAutoscaling {
                replicas,
                min: hpa.min_replicas,
                max: hpa.max_replicas,
            });
        }
        let scaled = self.with_replicas(replicas);
        scaled.validate()?;
        Ok(scaled)
    }

    /// Copy of this descriptor running a different image.
    pub fn with_image(&self, image: ImageRef) -> Self {
        Self {
            image,
            ..self.clone()
        }
    }
}

/// Step-by-step construction ending in a validated descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    inner: DeploymentDescriptor,
}

impl DescriptorBuilder {
    pub fn new(name: ServiceName, image: ImageRef) -> Self {
        Self {
            inner: DeploymentDescriptor {
                name,
                namespace: None,
                image,
                replicas: default_replicas(),
                env: BTreeMap::new(),
                ports: Vec::new(),
                volumes: Vec::new(),
                resources: ResourceRequirements::default(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                command: None,
                args: None,
                probe: None,
                strategy: None,
                domain: None,
                ssl: false,
                autoscaling: None,
                network_policy: None,
                service_account: None,
                pdb: None,
                placement: Placement::default(),
                mode: WorkloadMode::Replicated,
            },
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.inner.namespace = Some(namespace.into());
        self
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.inner.replicas = replicas;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, port: Port) -> Self {
        self.inner.ports.push(port);
        self
    }

    pub fn volume(mut self, volume: Volume) -> Self {
        self.inner.volumes.push(volume);
        self
    }

    pub fn resources(mut self, resources: ResourceRequirements) -> Self {
        self.inner.resources = resources;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.labels.insert(key.into(), value.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.annotations.insert(key.into(), value.into());
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.inner.command = Some(command);
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.inner.args = Some(args);
        self
    }

    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.inner.probe = Some(probe);
        self
    }

    pub fn strategy(mut self, strategy: RolloutStrategy) -> Self {
        self.inner.strategy = Some(strategy);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>, ssl: bool) -> Self {
        self.inner.domain = Some(domain.into());
        self.inner.ssl = ssl;
        self
    }

    pub fn autoscaling(mut self, hpa: HpaConfig) -> Self {
        self.inner.autoscaling = Some(hpa);
        self
    }

    pub fn network_policy(mut self, policy: NetworkPolicyConfig) -> Self {
        self.inner.network_policy = Some(policy);
        self
    }

    pub fn service_account(mut self, account: impl Into<String>) -> Self {
        self.inner.service_account = Some(account.into());
        self
    }

    pub fn pdb(mut self, pdb: PdbConfig) -> Self {
        self.inner.pdb = Some(pdb);
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.inner.placement = placement;
        self
    }

    pub fn mode(mut self, mode: WorkloadMode) -> Self {
        self.inner.mode = mode;
        self
    }

    pub fn build(self) -> Result<DeploymentDescriptor, DescriptorError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}
