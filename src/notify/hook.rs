// ABOUTME: Runs project hook scripts when a run succeeds or fails.
// ABOUTME: Scripts live in .rollout/hooks and receive run details as environment variables.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{Notifier, NotifyError, RunNotification};
use crate::status::DeploymentStatus;

/// The hook scripts a terminal run can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Success,
    Failure,
}

impl HookEvent {
    pub fn filename(&self) -> &'static str {
        match self {
            HookEvent::Success => "on-success",
            HookEvent::Failure => "on-failure",
        }
    }

    fn for_status(status: DeploymentStatus) -> Option<Self> {
        match status {
            DeploymentStatus::Succeeded => Some(HookEvent::Success),
            DeploymentStatus::Failed => Some(HookEvent::Failure),
            _ => None,
        }
    }
}

fn hook_env(n: &RunNotification) -> HashMap<&'static str, String> {
    let mut env = HashMap::from([
        ("ROLLOUT_SERVICE", n.service.to_string()),
        ("ROLLOUT_RUN_ID", n.run_id.to_string()),
        ("ROLLOUT_STATUS", n.status.to_string()),
        ("ROLLOUT_DURATION_MS", n.duration_ms.to_string()),
    ]);
    if let Some(error) = &n.error {
        env.insert("ROLLOUT_ERROR", error.clone());
    }
    env
}

/// Runs `.rollout/hooks/on-success` or `on-failure` when present.
#[derive(Debug, Clone)]
pub struct HookNotifier {
    hooks_dir: PathBuf,
}

impl HookNotifier {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            hooks_dir: project_dir.join(".rollout").join("hooks"),
        }
    }

    pub fn hook_path(&self, event: HookEvent) -> PathBuf {
        self.hooks_dir.join(event.filename())
    }
}

#[async_trait]
impl Notifier for HookNotifier {
    async fn notify(&self, notification: &RunNotification) -> Result<(), NotifyError> {
        let Some(event) = HookEvent::for_status(notification.status) else {
            return Ok(());
        };
        let path = self.hook_path(event);
        if !path.is_file() {
            return Ok(());
        }

        tracing::info!("Running {} hook: {}", event.filename(), path.display());
        let output = Command::new(&path)
            .envs(hook_env(notification))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| NotifyError::HookSpawn {
                hook: event.filename(),
                source,
            })?;

        if output.status.success() {
            tracing::debug!("{} hook completed", event.filename());
            Ok(())
        } else {
            Err(NotifyError::HookFailed {
                hook: event.filename(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
