// ABOUTME: Read-only commands: run status, live workload state, and control-plane health.
// ABOUTME: Human output is a short summary; --json prints the full records.

use super::context::Context;
use rollout::config::Config;
use rollout::diagnostics::Diagnostics;
use rollout::error::{Error, Result};
use rollout::orchestrator::{HealthStatus, Workload};
use rollout::output::Output;
use rollout::status::ServiceRecord;
use serde::Serialize;

#[derive(Serialize)]
struct StatusView<'a> {
    service: &'a str,
    record: Option<&'a ServiceRecord>,
    workload: Option<&'a Workload>,
}

pub async fn status(config: Config, output: Output) -> Result<()> {
    let ctx = Context::connect(&config, &output).await?;
    let record = ctx.pipeline.status(&config.service).await?;
    let workload = ctx
        .pipeline
        .describe(&config.service, config.namespace.as_deref())
        .await;
    let mut diag = Diagnostics::default();
    ctx.shutdown(&mut diag).await;
    let workload = workload?;

    let view = StatusView {
        service: config.service.as_str(),
        record: record.as_ref(),
        workload: workload.as_ref(),
    };
    output.report(&status_lines(&view), &view);
    Ok(())
}

fn status_lines(view: &StatusView<'_>) -> Vec<String> {
    let mut lines = vec![format!("Service: {}", view.service)];
    match view.record {
        Some(record) => {
            lines.push(format!("Last run: {}", record.status));
            if let Some(run) = &record.last_run_id {
                lines.push(format!("Run id: {}", run));
            }
            if let Some(failure) = &record.failure {
                lines.push(format!("Failure: {}", failure.message));
            }
            if record.rolled_back {
                lines.push("Rolled back to the previous deployment".to_string());
            }
        }
        None => lines.push("Last run: never deployed".to_string()),
    }
    match view.workload {
        Some(w) => {
            lines.push(format!(
                "Workload: {} ({}/{} ready)",
                w.status, w.replicas.ready, w.replicas.desired
            ));
            if let Some(image) = &w.image {
                lines.push(format!("Image: {}", image));
            }
            if let Some((min, max)) = w.autoscaling {
                lines.push(format!("Autoscaling: {}-{} replicas", min, max));
            }
            lines.extend(w.conditions.iter().map(|c| format!("  {}", c)));
        }
        None => lines.push("Workload: not found".to_string()),
    }
    lines
}

pub async fn health(config: Config, output: Output) -> Result<()> {
    let ctx = Context::connect(&config, &output).await?;
    let health = ctx.pipeline.health().await;
    let mut diag = Diagnostics::default();
    ctx.shutdown(&mut diag).await;

    output.report(&health_lines(&health), &health);
    if health.healthy {
        Ok(())
    } else {
        Err(Error::Unhealthy(health.message))
    }
}

fn health_lines(health: &HealthStatus) -> Vec<String> {
    let mut lines = vec![health.message.clone()];
    if let Some(details) = &health.details {
        if let Some(version) = &details.version {
            lines.push(format!("Version: {}", version));
        }
        if let Some(nodes) = details.nodes {
            lines.push(format!("Nodes: {}", nodes));
        }
        if let Some(endpoint) = &details.api_endpoint {
            lines.push(format!("Endpoint: {}", endpoint));
        }
    }
    lines
}

pub async fn remove(config: Config, output: Output) -> Result<()> {
    output.progress(&format!("Removing {}", config.service));
    let ctx = Context::connect(&config, &output).await?;
    let result = ctx
        .pipeline
        .remove(&config.service, config.namespace.as_deref())
        .await;
    let mut diag = Diagnostics::default();
    ctx.shutdown(&mut diag).await;
    for warning in diag.warnings() {
        output.warning(&warning.message);
    }
    result?;
    output.success(&format!("Removed {}", config.service));
    Ok(())
}
