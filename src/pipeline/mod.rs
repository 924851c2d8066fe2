// ABOUTME: Drives a service from source to a healthy workload: clone, build, apply, wait.
// ABOUTME: One run per service at a time; failures are recorded and rolled back when allowed.

mod error;
mod health;
mod locks;

pub use error::{PipelineError, PipelineErrorKind};
pub use health::health_timeout;
pub use locks::{LockError, LockInfo, ServiceGuard, ServiceLocks};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::build::{BuildPlan, CommandBuilder, RunScript, SourceRef, failure_log_script};
use crate::cancel::CancelToken;
use crate::descriptor::DeploymentDescriptor;
use crate::diagnostics::{Diagnostics, Warning};
use crate::executor::{ExecError, ExecTarget, RemoteExecutor};
use crate::notify::{Notifier, RunNotification, TracingNotifier};
use crate::orchestrator::{AdapterError, AdapterErrorKind, HealthStatus, OrchestratorAdapter, Workload};
use crate::status::{
    DeploymentStatus, FailureReason, Phase, RunKind, ServiceRecord, StatusError, StatusTracker,
};
use crate::types::{RunId, ServiceName};

/// What to do with a request for a service that already has a run in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    #[default]
    Reject,
    /// Wait for the active run to finish.
    Queue,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Where clone and build scripts run.
    pub target: ExecTarget,
    /// Root of per-service code and log directories on the target.
    pub work_dir: String,
    pub on_conflict: OnConflict,
    pub auto_rollback: bool,
    /// Added to a probe's failure budget when waiting for health.
    pub health_grace: Duration,
    /// Health wait for workloads without a probe.
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Runs allowed to execute at once across all services.
    pub max_concurrent_runs: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target: ExecTarget::Local,
            work_dir: ".rollout".to_string(),
            on_conflict: OnConflict::default(),
            auto_rollback: true,
            health_grace: Duration::from_secs(30),
            health_timeout: Duration::from_secs(120),
            health_poll_interval: Duration::from_secs(2),
            max_concurrent_runs: 3,
        }
    }
}

/// A deploy: the descriptor to run, and optionally how to produce its image.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub descriptor: DeploymentDescriptor,
    pub source: Option<SourceRef>,
    pub build: Option<BuildPlan>,
}

impl DeployRequest {
    /// Deploy an existing image with no build.
    pub fn image(descriptor: DeploymentDescriptor) -> Self {
        Self {
            descriptor,
            source: None,
            build: None,
        }
    }

    pub fn with_build(mut self, source: SourceRef, build: BuildPlan) -> Self {
        self.source = Some(source);
        self.build = Some(build);
        self
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub service: ServiceName,
    pub status: DeploymentStatus,
    /// Why the run failed; None on success.
    pub error: Option<PipelineError>,
    /// The previous descriptor was re-applied after the failure.
    pub rolled_back: bool,
    /// The descriptor now deployed, on success.
    pub deployed: Option<DeploymentDescriptor>,
    pub warnings: Vec<Warning>,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == DeploymentStatus::Succeeded
    }
}

struct ActiveRun<'a> {
    runs: &'a Mutex<HashMap<ServiceName, CancelToken>>,
    service: ServiceName,
    token: CancelToken,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.service);
    }
}

/// Per-run context threaded through the phases.
struct RunContext {
    run: RunId,
    service: ServiceName,
    kind: RunKind,
    entry: DeploymentStatus,
    /// Last successful descriptor when the run began.
    previous: Option<DeploymentDescriptor>,
    log_path: Option<String>,
    started: Instant,
    dropped_before: u64,
    diagnostics: Diagnostics,
}

pub struct DeploymentPipeline {
    adapter: Arc<dyn OrchestratorAdapter>,
    executor: Arc<RemoteExecutor>,
    tracker: StatusTracker,
    notifier: Arc<dyn Notifier>,
    builder: CommandBuilder,
    settings: PipelineSettings,
    locks: ServiceLocks,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<ServiceName, CancelToken>>,
}

impl DeploymentPipeline {
    pub fn new(
        adapter: Arc<dyn OrchestratorAdapter>,
        executor: Arc<RemoteExecutor>,
        tracker: StatusTracker,
        settings: PipelineSettings,
    ) -> Self {
        let locks = match tracker.lock_dir() {
            Some(dir) => ServiceLocks::in_dir(dir),
            None => ServiceLocks::new(),
        };
        Self {
            adapter,
            executor,
            tracker,
            notifier: Arc::new(TracingNotifier),
            builder: CommandBuilder::new(settings.work_dir.clone()),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1))),
            settings,
            locks,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn OrchestratorAdapter> {
        &self.adapter
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Deploy a descriptor, building its image first when the request has a build.
    ///
    /// Errors are returned only when no run was started (busy service, store
    /// failure). A run that starts always ends in a report, failed or not.
    pub async fn deploy(&self, request: DeployRequest) -> Result<RunReport, PipelineError> {
        let DeployRequest {
            descriptor,
            source,
            build,
        } = request;
        let service = descriptor.name.clone();
        let run = RunId::generate();

        let _guard = self.lock(&service, &run).await?;
        let previous = self
            .tracker
            .get(&service)
            .await?
            .and_then(|record| record.last_success_descriptor);
        let record = self.begin(&service, &run, RunKind::Deploy).await?;
        tracing::info!(service = %service, run = %run, "Deploying {}", descriptor.image);

        let active = self.register(&service);
        let mut ctx = self.context(run, service, RunKind::Deploy, &record, previous);
        if source.is_some() || build.is_some() {
            ctx.log_path = Some(self.builder.log_path(&ctx.service, &ctx.run));
        }

        let result = self
            .run_deploy(&mut ctx, descriptor, source.as_ref(), build.as_ref(), &active.token)
            .await;
        Ok(self.finish(ctx, result, &active.token).await)
    }

    /// Change the replica count of the last successful deployment, with no build.
    pub async fn scale(&self, service: &ServiceName, replicas: u32) -> Result<RunReport, PipelineError> {
        let run = RunId::generate();
        let _guard = self.lock(service, &run).await?;

        let previous = self
            .tracker
            .get(service)
            .await?
            .and_then(|record| record.last_success_descriptor)
            .ok_or_else(|| PipelineError::NoSuccessfulDeployment(service.clone()))?;
        let target = previous.scaled(replicas).map_err(PipelineError::InvalidScale)?;
        let record = self.begin(service, &run, RunKind::Scale).await?;
        tracing::info!(service = %service, run = %run, "Scaling to {} replicas", replicas);

        let active = self.register(service);
        let mut ctx = self.context(run, service.clone(), RunKind::Scale, &record, Some(previous));

        let result: Result<DeploymentDescriptor, PipelineError> = async {
            let _permit = self.permit(&active.token).await?;
            self.apply(&mut ctx, &target).await?;
            self.wait_healthy(&target, &active.token).await?;
            Ok(target)
        }
        .await;
        Ok(self.finish(ctx, result, &active.token).await)
    }

    /// Re-apply the deployment before the current one, with no build.
    ///
    /// After a failure that was not rolled back this restores the last
    /// successful descriptor. Otherwise it returns to the one before it, and
    /// a second rollback swaps back. Should the target not become healthy,
    /// the descriptor running before is restored.
    pub async fn rollback(&self, service: &ServiceName) -> Result<RunReport, PipelineError> {
        let run = RunId::generate();
        let _guard = self.lock(service, &run).await?;

        let record = self
            .tracker
            .get(service)
            .await?
            .ok_or_else(|| PipelineError::NoSuccessfulDeployment(service.clone()))?;
        let target = record
            .rollback_target()
            .cloned()
            .ok_or_else(|| PipelineError::NoRollbackTarget(service.clone()))?;
        let restore = match record.status {
            DeploymentStatus::Succeeded => record.last_success_descriptor.clone(),
            _ => None,
        };
        let record = self.begin(service, &run, RunKind::Rollback).await?;
        tracing::info!(service = %service, run = %run, "Rolling back to {}", target.image);

        let active = self.register(service);
        let mut ctx = self.context(run, service.clone(), RunKind::Rollback, &record, restore);

        let result: Result<DeploymentDescriptor, PipelineError> = async {
            let _permit = self.permit(&active.token).await?;
            if ctx.entry == DeploymentStatus::Pending {
                self.tracker
                    .transition(&ctx.service, &ctx.run, DeploymentStatus::Running)
                    .await?;
            }
            self.apply(&mut ctx, &target).await?;
            self.wait_healthy(&target, &active.token).await?;
            Ok(target)
        }
        .await;
        Ok(self.finish(ctx, result, &active.token).await)
    }

    /// Tear down the workload and forget the service.
    pub async fn remove(&self, service: &ServiceName, namespace: Option<&str>) -> Result<(), PipelineError> {
        let run = RunId::generate();
        let _guard = self.lock(service, &run).await?;

        let recorded = self
            .tracker
            .get(service)
            .await?
            .and_then(|record| record.last_success_descriptor)
            .and_then(|descriptor| descriptor.namespace);
        let namespace = namespace.or(recorded.as_deref());

        self.adapter
            .remove(service, namespace)
            .await
            .map_err(PipelineError::Remove)?;
        self.tracker.remove(service).await?;
        tracing::info!(service = %service, "Removed");
        Ok(())
    }

    /// Stop the service's active run. Returns false when nothing was running.
    pub fn cancel(&self, service: &ServiceName) -> bool {
        match self.active.lock().get(service) {
            Some(token) => {
                tracing::info!(service = %service, "Cancelling active run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run.
    pub fn cancel_all(&self) -> usize {
        let active = self.active.lock();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    pub async fn status(&self, service: &ServiceName) -> Result<Option<ServiceRecord>, PipelineError> {
        Ok(self.tracker.get(service).await?)
    }

    pub async fn describe(
        &self,
        service: &ServiceName,
        namespace: Option<&str>,
    ) -> Result<Option<Workload>, AdapterError> {
        self.adapter.describe(service, namespace).await
    }

    pub async fn health(&self) -> HealthStatus {
        self.adapter.health_check().await
    }

    /// Take the service lock, failing the record of any dead run it replaced.
    async fn lock(&self, service: &ServiceName, run: &RunId) -> Result<ServiceGuard, PipelineError> {
        let locked = match self.settings.on_conflict {
            OnConflict::Reject => self.locks.try_acquire(service, run).await,
            OnConflict::Queue => {
                if let Some(holder) = self.locks.holder(service) {
                    tracing::info!(service = %service, "Waiting for run {} to finish", holder.run_id);
                }
                self.locks.acquire(service, run).await
            }
        };
        let guard = locked.map_err(|e| match e {
            LockError::Held(holder) => PipelineError::ConcurrencyRejected {
                service: service.clone(),
                holder,
            },
            e => PipelineError::Lock(e),
        })?;

        if let Some(stale) = guard.replaced() {
            self.tracker.abandon(service, &stale.run_id).await?;
        }
        Ok(guard)
    }

    async fn begin(&self, service: &ServiceName, run: &RunId, kind: RunKind) -> Result<ServiceRecord, PipelineError> {
        self.tracker
            .begin(service, run, kind)
            .await
            .map_err(|e| match e {
                StatusError::InFlight { run, .. } => {
                    tracing::warn!(service = %service, "Record is still owned by run {:?}", run);
                    PipelineError::ConcurrencyRejected {
                        service: service.clone(),
                        holder: None,
                    }
                }
                e => e.into(),
            })
    }

    fn register(&self, service: &ServiceName) -> ActiveRun<'_> {
        let token = CancelToken::new();
        self.active.lock().insert(service.clone(), token.clone());
        ActiveRun {
            runs: &self.active,
            service: service.clone(),
            token,
        }
    }

    fn context(
        &self,
        run: RunId,
        service: ServiceName,
        kind: RunKind,
        record: &ServiceRecord,
        previous: Option<DeploymentDescriptor>,
    ) -> RunContext {
        RunContext {
            run,
            service,
            kind,
            entry: record.status,
            previous,
            log_path: None,
            started: Instant::now(),
            dropped_before: self.executor.sink().dropped(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Wait for a global run slot. A queued run stays in its entry state.
    async fn permit(&self, cancel: &CancelToken) -> Result<OwnedSemaphorePermit, PipelineError> {
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                // The semaphore is never closed.
                permit.map_err(|_| PipelineError::Cancelled)
            }
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    async fn run_deploy(
        &self,
        ctx: &mut RunContext,
        descriptor: DeploymentDescriptor,
        source: Option<&SourceRef>,
        build: Option<&BuildPlan>,
        cancel: &CancelToken,
    ) -> Result<DeploymentDescriptor, PipelineError> {
        for gap in self.adapter.preflight(&descriptor).map_err(adapter_error)? {
            ctx.diagnostics.warn(Warning::capability_degraded(format!(
                "{} ignores {} for {}",
                self.adapter.kind(),
                gap,
                ctx.service
            )));
        }

        let _permit = self.permit(cancel).await?;
        if ctx.entry == DeploymentStatus::Pending {
            self.tracker
                .transition(&ctx.service, &ctx.run, DeploymentStatus::Running)
                .await?;
        }

        let mut descriptor = descriptor;
        if let (Some(source), Some(log_path)) = (source, &ctx.log_path) {
            let script = self.builder.clone_script(source, &ctx.service, log_path);
            self.run_step(Phase::Clone, &script, &ctx.run, cancel).await?;
        }
        if let (Some(plan), Some(log_path)) = (build, &ctx.log_path) {
            descriptor = descriptor.with_image(descriptor.image.with_tag(ctx.run.short()));
            let script = self.builder.build_script(plan, &descriptor, log_path);
            self.run_step(Phase::Build, &script, &ctx.run, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.apply(ctx, &descriptor).await?;
        self.wait_healthy(&descriptor, cancel).await?;
        Ok(descriptor)
    }

    async fn run_step(
        &self,
        phase: Phase,
        script: &RunScript,
        run: &RunId,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        tracing::info!(run = %run, "Starting {} on {}", phase, self.settings.target);
        let outcome = self
            .executor
            .execute(script, &self.settings.target, run, cancel)
            .await
            .map_err(|source| match source {
                ExecError::Cancelled => PipelineError::Cancelled,
                source => PipelineError::Exec { phase, source },
            })?;
        if !outcome.success() {
            return Err(PipelineError::Build {
                phase,
                exit_code: outcome.exit_code,
                tail: outcome.tail,
            });
        }
        Ok(())
    }

    async fn apply(&self, ctx: &mut RunContext, descriptor: &DeploymentDescriptor) -> Result<(), PipelineError> {
        let report = self.adapter.apply(descriptor).await.map_err(adapter_error)?;
        // Gaps were already reported by the deploy preflight.
        if ctx.kind != RunKind::Deploy {
            for gap in report.ignored {
                ctx.diagnostics.warn(Warning::capability_degraded(format!(
                    "{} ignores {} for {}",
                    self.adapter.kind(),
                    gap,
                    ctx.service
                )));
            }
        }
        Ok(())
    }

    async fn wait_healthy(&self, descriptor: &DeploymentDescriptor, cancel: &CancelToken) -> Result<(), PipelineError> {
        let timeout = health_timeout(
            descriptor,
            self.settings.health_grace,
            self.settings.health_timeout,
        );
        tracing::debug!("Waiting up to {:?} for {} to become healthy", timeout, descriptor.name);
        health::wait_healthy(
            self.adapter.as_ref(),
            descriptor,
            timeout,
            self.settings.health_poll_interval,
            cancel,
        )
        .await
    }

    async fn finish(
        &self,
        mut ctx: RunContext,
        result: Result<DeploymentDescriptor, PipelineError>,
        cancel: &CancelToken,
    ) -> RunReport {
        let dropped = self.executor.sink().dropped().saturating_sub(ctx.dropped_before);
        if dropped > 0 {
            ctx.diagnostics.warn(Warning::log_backlog_dropped(dropped));
        }

        let (status, error, rolled_back, deployed) = match result {
            Ok(deployed) => match self
                .tracker
                .succeed(&ctx.service, &ctx.run, deployed.clone())
                .await
            {
                Ok(_) => (DeploymentStatus::Succeeded, None, false, Some(deployed)),
                Err(e) => (DeploymentStatus::Failed, Some(PipelineError::from(e)), false, None),
            },
            Err(error) => {
                let error = if cancel.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    error
                };
                let rolled_back = self.fail(&mut ctx, &error).await;
                (DeploymentStatus::Failed, Some(error), rolled_back, None)
            }
        };

        let duration = ctx.started.elapsed();
        let notification = RunNotification {
            service: ctx.service.clone(),
            run_id: ctx.run.clone(),
            status,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            error: error.as_ref().map(ToString::to_string),
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            ctx.diagnostics
                .warn(Warning::notification_failed(format!("notification failed: {}", e)));
        }

        RunReport {
            run_id: ctx.run,
            service: ctx.service,
            status,
            error,
            rolled_back,
            deployed,
            warnings: ctx.diagnostics.into_warnings(),
            duration,
        }
    }

    /// Record a failed run; returns whether the previous descriptor was re-applied.
    async fn fail(&self, ctx: &mut RunContext, error: &PipelineError) -> bool {
        tracing::error!(service = %ctx.service, run = %ctx.run, "Run failed: {}", error);

        if let Some(log_path) = &ctx.log_path {
            let script = failure_log_script(log_path, &error.to_string());
            let detached = CancelToken::new();
            if let Err(e) = self
                .executor
                .execute(&script, &self.settings.target, &ctx.run, &detached)
                .await
            {
                tracing::debug!("Could not append failure to {}: {}", log_path, e);
            }
        }

        let rolled_back = match &ctx.previous {
            Some(previous)
                if self.settings.auto_rollback
                    && error.touched_platform()
                    && error.kind() != PipelineErrorKind::Cancelled =>
            {
                tracing::warn!(service = %ctx.service, "Rolling back to {}", previous.image);
                match self.adapter.apply(previous).await {
                    Ok(_) => true,
                    Err(e) => {
                        ctx.diagnostics
                            .warn(Warning::rollback_failed(format!("rollback failed: {}", e)));
                        false
                    }
                }
            }
            _ => false,
        };

        let reason = FailureReason::new(error.phase(), error.to_string()).with_tail(error.tail().to_vec());
        if let Err(e) = self
            .tracker
            .fail(&ctx.service, &ctx.run, reason, rolled_back)
            .await
        {
            tracing::error!(service = %ctx.service, "Could not record failure: {}", e);
        }
        rolled_back
    }
}

fn adapter_error(e: AdapterError) -> PipelineError {
    match e.kind() {
        AdapterErrorKind::Capability => PipelineError::Capability(e),
        _ => PipelineError::Apply(e),
    }
}
