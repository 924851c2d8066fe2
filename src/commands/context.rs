// ABOUTME: Wires a loaded config into a ready pipeline: SSH, executor, store, adapter, notifiers.
// ABOUTME: Shared by every command that talks to the orchestrator.

use rollout::config::Config;
use rollout::diagnostics::{Diagnostics, Warning};
use rollout::error::Result;
use rollout::executor::{LogChannel, LogReceiver, RemoteExecutor, SshTransport};
use rollout::notify::{Fanout, HookNotifier, TracingNotifier};
use rollout::orchestrator::{OrchestratorSettings, connect};
use rollout::output::Output;
use rollout::pipeline::DeploymentPipeline;
use rollout::ssh::Session;
use rollout::status::{FileStatusStore, StatusTracker};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Context {
    pub pipeline: Arc<DeploymentPipeline>,
    logs: Option<LogReceiver>,
    channel: LogChannel,
    session: Option<Arc<Session>>,
}

impl Context {
    pub async fn connect(config: &Config, output: &Output) -> Result<Self> {
        let session = match config.target.remote() {
            Some(host) => {
                output.progress(&format!("  → Connecting to {}...", config.target));
                let user = env::var("USER").unwrap_or_else(|_| "root".to_string());
                let session = Session::connect(host.session_config(&user)).await?;
                Some(Arc::new(session))
            }
            None => None,
        };

        let (channel, logs) = LogChannel::bounded(config.pipeline.log_buffer);
        let mut executor = RemoteExecutor::new(Arc::new(channel.clone()))
            .with_settings(config.pipeline.exec_settings());
        if let (Some(host), Some(session)) = (config.target.remote(), &session) {
            executor = executor.with_remote(
                host.host_id(),
                Arc::new(SshTransport::new(host.host_id(), Arc::clone(session))),
            );
        }

        output.progress(&format!("  → Connecting to {} orchestrator...", orchestrator_name(config)));
        let adapter = connect(
            &config.orchestrator,
            config.pipeline.capabilities,
            session.clone(),
        )
        .await?;

        let home = env::var_os("HOME").map(PathBuf::from);
        let state_dir = config.pipeline.state_dir(home.as_deref());
        tracing::debug!("Run records in {}", state_dir.display());
        let tracker = StatusTracker::new(Arc::new(FileStatusStore::new(state_dir)));

        let project_dir = env::current_dir()?;
        let notifier = Fanout::new()
            .with(Arc::new(TracingNotifier))
            .with(Arc::new(HookNotifier::new(&project_dir)));

        let pipeline = DeploymentPipeline::new(
            adapter,
            Arc::new(executor),
            tracker,
            config.pipeline_settings(),
        )
        .with_notifier(Arc::new(notifier));

        Ok(Self {
            pipeline: Arc::new(pipeline),
            logs: Some(logs),
            channel,
            session,
        })
    }

    /// The live log stream; only one consumer may take it.
    pub fn take_logs(&mut self) -> Option<LogReceiver> {
        self.logs.take()
    }

    /// Close the log channel and drop the SSH session. Failures only warn.
    pub async fn shutdown(self, diag: &mut Diagnostics) {
        self.channel.close();
        if let Some(session) = self.session
            && let Err(e) = session.disconnect().await
        {
            diag.warn(Warning::ssh_disconnect(format!("SSH disconnect failed: {}", e)));
        }
    }
}

fn orchestrator_name(config: &Config) -> &'static str {
    match config.orchestrator {
        OrchestratorSettings::Swarm { .. } => "swarm",
        OrchestratorSettings::Cluster { .. } => "cluster",
    }
}
