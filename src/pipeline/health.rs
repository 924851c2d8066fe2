// ABOUTME: Bounded wait for an applied workload to report healthy.
// ABOUTME: Polls describe until the applied image is rolled out; running out of time is a failure.

use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::PipelineError;
use crate::cancel::CancelToken;
use crate::descriptor::DeploymentDescriptor;
use crate::orchestrator::OrchestratorAdapter;
use crate::status::DeploymentStatus;

/// How long a workload gets to become healthy.
///
/// With a probe this is the probe's own failure budget plus `grace`; without
/// one it is `fallback`.
pub fn health_timeout(descriptor: &DeploymentDescriptor, grace: Duration, fallback: Duration) -> Duration {
    match &descriptor.probe {
        Some(probe) => probe.failure_budget() + grace,
        None => fallback,
    }
}

pub(crate) async fn wait_healthy(
    adapter: &dyn OrchestratorAdapter,
    descriptor: &DeploymentDescriptor,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let deadline = Instant::now() + timeout;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        }

        match adapter
            .describe(&descriptor.name, descriptor.namespace.as_deref())
            .await
        {
            Ok(Some(workload)) if workload.is_healthy() && workload.runs(&descriptor.image) => {
                tracing::debug!(
                    "{} healthy with {}/{} replicas ready",
                    descriptor.name,
                    workload.replicas.ready,
                    workload.replicas.desired
                );
                return Ok(());
            }
            Ok(Some(workload)) if workload.status == DeploymentStatus::Failed => {
                let detail = if workload.conditions.is_empty() {
                    workload.status.to_string()
                } else {
                    workload.conditions.join(", ")
                };
                return Err(PipelineError::HealthFailed(detail));
            }
            Ok(Some(workload)) if !workload.runs(&descriptor.image) => {
                last = Some(format!(
                    "still on {}",
                    workload.image.as_deref().unwrap_or("no image")
                ));
            }
            Ok(Some(workload)) => {
                last = Some(format!(
                    "{} ({}/{} ready)",
                    workload.status, workload.replicas.ready, workload.replicas.desired
                ));
            }
            Ok(None) => last = Some("workload not found".to_string()),
            Err(e) => {
                tracing::debug!("describe failed while waiting for {}: {}", descriptor.name, e);
                last = Some(e.to_string());
            }
        }

        if Instant::now() >= deadline {
            return Err(PipelineError::HealthTimeout { timeout, last });
        }
    }
}
