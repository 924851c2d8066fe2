// ABOUTME: Terminal-run notifications: who hears about succeeded and failed runs.
// ABOUTME: Ships a tracing notifier, a hook-script notifier, and a fan-out over several.

mod hook;

pub use hook::{HookEvent, HookNotifier};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::status::DeploymentStatus;
use crate::types::{RunId, ServiceName};

/// Sent once per run, when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunNotification {
    pub service: ServiceName,
    pub run_id: RunId,
    pub status: DeploymentStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{hook} hook exited with code {code:?}: {stderr}")]
    HookFailed {
        hook: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run {hook} hook: {source}")]
    HookSpawn {
        hook: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// One or more notifiers in a fan-out failed.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Several(Vec<NotifyError>),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Failures never change the run's outcome.
    async fn notify(&self, notification: &RunNotification) -> Result<(), NotifyError>;
}

/// Logs each terminal run.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: &RunNotification) -> Result<(), NotifyError> {
        match &n.error {
            None => tracing::info!(
                service = %n.service,
                run = %n.run_id,
                duration_ms = n.duration_ms,
                "Run {}",
                n.status
            ),
            Some(error) => tracing::warn!(
                service = %n.service,
                run = %n.run_id,
                duration_ms = n.duration_ms,
                "Run {}: {}",
                n.status,
                error
            ),
        }
        Ok(())
    }
}

/// Delivers to every inner notifier, collecting failures.
#[derive(Default, Clone)]
pub struct Fanout {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for Fanout {
    async fn notify(&self, notification: &RunNotification) -> Result<(), NotifyError> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(notification).await {
                failures.push(e);
            }
        }
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(NotifyError::Several(failures)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _: &RunNotification) -> Result<(), NotifyError> {
            Err(NotifyError::HookFailed {
                hook: "on-failure",
                code: Some(2),
                stderr: "boom".to_string(),
            })
        }
    }

    fn notification() -> RunNotification {
        RunNotification {
            service: ServiceName::new("web").unwrap(),
            run_id: RunId::new("r1"),
            status: DeploymentStatus::Succeeded,
            duration_ms: 1200,
            error: None,
        }
    }

    #[tokio::test]
    async fn fanout_reaches_every_notifier_and_reports_failures() {
        let fanout = Fanout::new()
            .with(Arc::new(Failing))
            .with(Arc::new(TracingNotifier))
            .with(Arc::new(Failing));
        assert_eq!(fanout.len(), 3);

        let err = fanout.notify(&notification()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Several(ref all) if all.len() == 2));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn empty_fanout_succeeds() {
        assert!(Fanout::new().notify(&notification()).await.is_ok());
    }

    #[test]
    fn notification_serializes_without_absent_error() {
        let json = serde_json::to_value(notification()).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("error").is_none());
    }
}
