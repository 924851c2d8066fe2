// ABOUTME: Diagnostics accumulator for non-fatal warnings during a run.
// ABOUTME: Collects warnings that shouldn't fail a run but should be shown to users.

use serde::Serialize;

/// Collects non-fatal warnings during pipeline operations.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

/// A non-fatal warning collected during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A descriptor feature was left out under the degrade policy.
    pub fn capability_degraded(message: impl Into<String>) -> Self {
        Self::new(WarningKind::CapabilityDegraded, message)
    }

    pub fn rollback_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::RollbackFailed, message)
    }

    pub fn notification_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::NotificationFailed, message)
    }

    /// Log lines were dropped because the consumer fell behind.
    pub fn log_backlog_dropped(count: u64) -> Self {
        Self::new(
            WarningKind::LogBacklogDropped,
            format!("{} log lines dropped while the viewer fell behind", count),
        )
    }

    pub fn ssh_disconnect(message: impl Into<String>) -> Self {
        Self::new(WarningKind::SshDisconnect, message)
    }
}

/// Categories of warnings that can occur during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    CapabilityDegraded,
    /// Re-applying the last good descriptor failed after a failed run.
    RollbackFailed,
    NotificationFailed,
    LogBacklogDropped,
    /// Failed to cleanly disconnect SSH session.
    SshDisconnect,
}
