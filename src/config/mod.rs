// ABOUTME: Configuration types and parsing for rollout.yml.
// ABOUTME: Handles YAML parsing, env var interpolation, and destination merging.

mod deserialize;
mod env_value;
mod init;
mod target;

pub use env_value::{EnvValue, resolve_env_map, resolve_env_map_with};
pub use init::init_config;
pub use target::{RemoteHost, Target};

use deserialize::{deserialize_command, deserialize_ports, deserialize_target, deserialize_target_option};

use crate::build::{BuildPlan, SourceRef};
use crate::descriptor::{
    DeploymentDescriptor, HpaConfig, NetworkPolicyConfig, PdbConfig, Placement, Port,
    ProbeConfig, ResourceRequirements, RolloutStrategy, Volume, WorkloadMode,
};
use crate::error::{Error, Result};
use crate::executor::ExecSettings;
use crate::orchestrator::{CapabilityPolicy, OrchestratorSettings};
use crate::pipeline::{DeployRequest, OnConflict, PipelineSettings};
use crate::types::{ImageRef, ServiceName};
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "rollout.yml";
pub const CONFIG_FILENAME_ALT: &str = "rollout.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".rollout/config.yml";

/// Where run records live when `pipeline.state_dir` is unset, relative to `$HOME`.
const STATE_DIR: &str = ".local/state/rollout";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceName,
    pub image: ImageRef,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    #[serde(default, deserialize_with = "deserialize_ports")]
    pub ports: Vec<Port>,

    #[serde(default)]
    pub volumes: Vec<Volume>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "deserialize_command")]
    pub command: Option<NonEmpty<String>>,

    #[serde(default)]
    pub args: Option<Vec<String>>,

    #[serde(default)]
    pub probe: Option<ProbeConfig>,

    #[serde(default)]
    pub strategy: Option<RolloutStrategy>,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub autoscaling: Option<HpaConfig>,

    #[serde(default)]
    pub network_policy: Option<NetworkPolicyConfig>,

    #[serde(default)]
    pub service_account: Option<String>,

    #[serde(default)]
    pub pdb: Option<PdbConfig>,

    #[serde(default)]
    pub placement: Placement,

    #[serde(default)]
    pub mode: WorkloadMode,

    /// Repository to clone; without it the image is deployed as-is.
    #[serde(default)]
    pub source: Option<SourceRef>,

    #[serde(default)]
    pub build: Option<BuildPlan>,

    #[serde(default, deserialize_with = "deserialize_target")]
    pub target: Target,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub destinations: HashMap<String, Destination>,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Destination {
    #[serde(default, deserialize_with = "deserialize_target_option")]
    pub target: Option<Target>,

    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub replicas: Option<u32>,

    #[serde(default)]
    pub orchestrator: Option<OrchestratorSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub on_conflict: OnConflict,
    pub auto_rollback: bool,
    pub capabilities: CapabilityPolicy,
    #[serde(with = "humantime_serde")]
    pub health_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub health_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub health_poll_interval: Duration,
    /// How often remote log files are checked for new lines.
    #[serde(with = "humantime_serde")]
    pub log_poll_interval: Duration,
    /// Lines held for the live viewer before the oldest are dropped.
    pub log_buffer: usize,
    /// Lines of output kept for failure reports.
    pub output_tail: usize,
    pub max_concurrent_runs: usize,
    #[serde(with = "humantime_serde")]
    pub run_timeout: Option<Duration>,
    pub work_dir: String,
    pub state_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let pipeline = PipelineSettings::default();
        let exec = ExecSettings::default();
        Self {
            on_conflict: pipeline.on_conflict,
            auto_rollback: pipeline.auto_rollback,
            capabilities: CapabilityPolicy::default(),
            health_grace: pipeline.health_grace,
            health_timeout: pipeline.health_timeout,
            health_poll_interval: pipeline.health_poll_interval,
            log_poll_interval: exec.poll_interval,
            log_buffer: 10_000,
            output_tail: exec.tail_lines,
            max_concurrent_runs: pipeline.max_concurrent_runs,
            run_timeout: exec.run_timeout,
            work_dir: pipeline.work_dir,
            state_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn exec_settings(&self) -> ExecSettings {
        ExecSettings {
            poll_interval: self.log_poll_interval,
            tail_lines: self.output_tail,
            run_timeout: self.run_timeout,
        }
    }

    /// Run records directory: `state_dir` when set, else under `home`.
    pub fn state_dir(&self, home: Option<&Path>) -> PathBuf {
        match (&self.state_dir, home) {
            (Some(dir), _) => dir.clone(),
            (None, Some(home)) => home.join(STATE_DIR),
            (None, None) => PathBuf::from(".rollout/state"),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                tracing::debug!("Loading config from {}", path.display());
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    fn validate(&self) -> Result<()> {
        if self.build.is_some() && self.source.is_none() {
            return Err(Error::InvalidConfig(
                "`build` needs a `source` to build from".to_string(),
            ));
        }
        if self.pipeline.max_concurrent_runs == 0 {
            return Err(Error::InvalidConfig(
                "pipeline.max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.pipeline.log_buffer == 0 {
            return Err(Error::InvalidConfig(
                "pipeline.log_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn for_destination(&self, name: &str) -> Result<Config> {
        let dest = self
            .destinations
            .get(name)
            .ok_or_else(|| Error::UnknownDestination(name.to_string()))?;

        let mut merged = self.clone();

        if let Some(target) = &dest.target {
            merged.target = target.clone();
        }

        for (k, v) in &dest.env {
            merged.env.insert(k.clone(), v.clone());
        }

        for (k, v) in &dest.labels {
            merged.labels.insert(k.clone(), v.clone());
        }

        if let Some(replicas) = dest.replicas {
            merged.replicas = replicas;
        }

        if let Some(orchestrator) = &dest.orchestrator {
            merged.orchestrator = orchestrator.clone();
        }

        Ok(merged)
    }

    /// The validated descriptor, with env references resolved from the current process.
    pub fn descriptor(&self) -> Result<DeploymentDescriptor> {
        let mut builder = DeploymentDescriptor::builder(self.service.clone(), self.image.clone())
            .replicas(self.replicas)
            .resources(self.resources.clone())
            .placement(self.placement.clone())
            .mode(self.mode);

        if let Some(namespace) = &self.namespace {
            builder = builder.namespace(namespace);
        }
        for (k, v) in resolve_env_map(&self.env)? {
            builder = builder.env(k, v);
        }
        for port in &self.ports {
            builder = builder.port(port.clone());
        }
        for volume in &self.volumes {
            builder = builder.volume(volume.clone());
        }
        for (k, v) in &self.labels {
            builder = builder.label(k, v);
        }
        for (k, v) in &self.annotations {
            builder = builder.annotation(k, v);
        }
        if let Some(command) = &self.command {
            builder = builder.command(command.iter().cloned().collect());
        }
        if let Some(args) = &self.args {
            builder = builder.args(args.clone());
        }
        if let Some(probe) = &self.probe {
            builder = builder.probe(probe.clone());
        }
        if let Some(strategy) = &self.strategy {
            builder = builder.strategy(strategy.clone());
        }
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain, self.ssl);
        }
        if let Some(hpa) = &self.autoscaling {
            builder = builder.autoscaling(hpa.clone());
        }
        if let Some(policy) = &self.network_policy {
            builder = builder.network_policy(policy.clone());
        }
        if let Some(account) = &self.service_account {
            builder = builder.service_account(account);
        }
        if let Some(pdb) = &self.pdb {
            builder = builder.pdb(*pdb);
        }

        Ok(builder.build()?)
    }

    /// Deploy request for this service, with a build step when a source is configured.
    pub fn deploy_request(&self) -> Result<DeployRequest> {
        let request = DeployRequest::image(self.descriptor()?);
        Ok(match (&self.source, &self.build) {
            (Some(source), Some(plan)) => request.with_build(source.clone(), plan.clone()),
            (Some(_), None) => {
                return Err(Error::InvalidConfig(
                    "`source` is set but no `build` strategy is configured".to_string(),
                ));
            }
            _ => request,
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            target: self.target.exec_target(),
            work_dir: p.work_dir.clone(),
            on_conflict: p.on_conflict,
            auto_rollback: p.auto_rollback,
            health_grace: p.health_grace,
            health_timeout: p.health_timeout,
            health_poll_interval: p.health_poll_interval,
            max_concurrent_runs: p.max_concurrent_runs,
        }
    }
}
