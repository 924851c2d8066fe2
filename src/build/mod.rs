// ABOUTME: Pure construction of clone and build scripts for a pipeline run.
// ABOUTME: No I/O happens here; the executor runs what this module produces.

mod script;
mod source;
mod strategy;

pub use script::{RunScript, compose, failure_log_script, quote};
pub use source::{SourceRef, clone_command, redact_url};
pub use strategy::{BuildPlan, BuildStrategy, build_command};

use crate::descriptor::DeploymentDescriptor;
use crate::types::{RunId, ServiceName};

/// Lays out per-service directories under a work dir and composes run scripts.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    work_dir: String,
}

impl CommandBuilder {
    pub fn new(work_dir: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn code_dir(&self, service: &ServiceName) -> String {
        format!("{}/{}/code", self.work_dir, service)
    }

    pub fn log_path(&self, service: &ServiceName, run: &RunId) -> String {
        format!("{}/logs/{}/{}-{}.log", self.work_dir, service, service, run)
    }

    pub fn clone_script(&self, source: &SourceRef, service: &ServiceName, log_path: &str) -> RunScript {
        compose(&[clone_command(source, &self.code_dir(service))], log_path)
    }

    pub fn build_script(
        &self,
        plan: &BuildPlan,
        descriptor: &DeploymentDescriptor,
        log_path: &str,
    ) -> RunScript {
        let banner = quote(&format!(
            "Building {} with {}",
            descriptor.image,
            plan.strategy.name()
        ));
        let steps = [
            format!("echo {}", banner),
            build_command(plan, descriptor, &self.code_dir(&descriptor.name)),
        ];
        compose(&steps, log_path)
    }
}
