// ABOUTME: Deploy, scale and rollback command implementations.
// ABOUTME: Streams build output live and cancels the run on Ctrl-C.

use super::context::Context;
use futures::{StreamExt, future};
use rollout::config::Config;
use rollout::diagnostics::Diagnostics;
use rollout::error::{Error, Result};
use rollout::executor::LogReceiver;
use rollout::output::Output;
use rollout::pipeline::{DeploymentPipeline, PipelineError, RunReport};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Build (when configured) and deploy the service.
pub async fn deploy(config: Config, mut output: Output) -> Result<()> {
    output.start_timer();
    let request = config.deploy_request()?;

    output.progress(&format!(
        "Deploying {} ({}) from {}",
        config.service, config.image, config.target
    ));

    let ctx = Context::connect(&config, &output).await?;
    let pipeline = Arc::clone(&ctx.pipeline);
    let report = run_interruptible(ctx, &output, pipeline.deploy(request)).await?;
    finish(report, &output, "Deployment complete!")
}

/// Re-apply the last successful deployment with a new replica count.
pub async fn scale(config: Config, replicas: u32, mut output: Output) -> Result<()> {
    output.start_timer();
    output.progress(&format!("Scaling {} to {} replica(s)", config.service, replicas));

    let ctx = Context::connect(&config, &output).await?;
    let pipeline = Arc::clone(&ctx.pipeline);
    let report = run_interruptible(ctx, &output, pipeline.scale(&config.service, replicas)).await?;
    finish(report, &output, &format!("Scaled to {} replica(s)", replicas))
}

/// Put the previous deployment back without building.
pub async fn rollback(config: Config, mut output: Output) -> Result<()> {
    output.start_timer();
    output.progress(&format!("Rolling back {}", config.service));

    let ctx = Context::connect(&config, &output).await?;
    let pipeline = Arc::clone(&ctx.pipeline);
    let report = run_interruptible(ctx, &output, pipeline.rollback(&config.service)).await?;
    finish(report, &output, "Rollback complete!")
}

/// Drive `run` to completion with a live log viewer and a Ctrl-C handler attached.
async fn run_interruptible<F>(mut ctx: Context, output: &Output, run: F) -> Result<RunReport>
where
    F: Future<Output = std::result::Result<RunReport, PipelineError>>,
{
    let viewer = ctx.take_logs().map(|logs| spawn_log_viewer(logs, output.clone()));
    let interrupt = spawn_interrupt_handler(Arc::clone(&ctx.pipeline));

    let result = run.await;

    interrupt.abort();
    let mut diag = Diagnostics::default();
    ctx.shutdown(&mut diag).await;
    if let Some(viewer) = viewer
        && let Err(e) = viewer.await
    {
        tracing::debug!("Log viewer ended abnormally: {}", e);
    }
    for warning in diag.warnings() {
        output.warning(&warning.message);
    }

    Ok(result?)
}

fn spawn_log_viewer(logs: LogReceiver, output: Output) -> JoinHandle<()> {
    tokio::spawn(logs.into_stream().for_each(move |record| {
        output.log_line(record.run.short(), &record.line);
        future::ready(())
    }))
}

fn spawn_interrupt_handler(pipeline: Arc<DeploymentPipeline>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = pipeline.cancel_all();
            tracing::warn!("Interrupted; cancelling {} run(s)", cancelled);
        }
    })
}

#[derive(Serialize)]
struct RunSummary<'a> {
    event: &'static str,
    service: &'a str,
    run_id: &'a str,
    status: &'a str,
    rolled_back: bool,
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<&'static str>,
}

fn finish(report: RunReport, output: &Output, success_message: &str) -> Result<()> {
    for warning in &report.warnings {
        output.warning(&warning.message);
    }

    let error = report.error.as_ref().map(|e| e.to_string());
    let summary = RunSummary {
        event: "run",
        service: report.service.as_str(),
        run_id: report.run_id.as_str(),
        status: report.status.as_str(),
        rolled_back: report.rolled_back,
        duration_ms: report.duration.as_millis(),
        error: error.clone(),
        phase: report
            .error
            .as_ref()
            .and_then(|e| e.phase())
            .map(|p| p.as_str()),
    };

    if report.succeeded() {
        output.report(&[], &summary);
        output.success(success_message);
        return Ok(());
    }

    let mut lines = vec![format!(
        "  ✗ Run {} failed: {}",
        report.run_id.short(),
        error.as_deref().unwrap_or("unknown error")
    )];
    if let Some(e) = &report.error {
        lines.extend(e.tail().iter().map(|line| format!("  │ {}", line)));
    }
    if report.rolled_back {
        lines.push("  → Previous deployment restored".to_string());
    }
    output.report(&lines, &summary);

    Err(Error::RunFailed {
        service: report.service,
        run: report.run_id.into_inner(),
    })
}
