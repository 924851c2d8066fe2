// ABOUTME: Runs composed scripts on a target host and streams their log as it grows.
// ABOUTME: Returns the exit code plus a bounded tail of output for diagnostics.

mod error;
mod local;
mod sink;
mod ssh;
mod transport;

pub use error::ExecError;
pub use local::LocalTransport;
pub use sink::{LineSplitter, LogChannel, LogReceiver, LogRecord, LogSink, OutputTail, TracingSink};
pub use ssh::SshTransport;
pub use transport::Transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::build::RunScript;
use crate::cancel::CancelToken;
use crate::types::{HostId, RunId};

/// Where a script runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecTarget {
    Local,
    Remote(HostId),
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecTarget::Local => write!(f, "local"),
            ExecTarget::Remote(host) => write!(f, "{}", host),
        }
    }
}

/// Result of a script that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    /// Last lines of output, oldest first.
    pub tail: Vec<String>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct ExecSettings {
    /// How often the log file is checked for new output.
    pub poll_interval: Duration,
    pub tail_lines: usize,
    /// Upper bound on a single script's runtime.
    pub run_timeout: Option<Duration>,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            tail_lines: 50,
            run_timeout: None,
        }
    }
}

pub struct RemoteExecutor {
    local: Arc<dyn Transport>,
    remotes: HashMap<HostId, Arc<dyn Transport>>,
    sink: Arc<dyn LogSink>,
    settings: ExecSettings,
}

impl RemoteExecutor {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            local: Arc::new(LocalTransport),
            remotes: HashMap::new(),
            sink,
            settings: ExecSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ExecSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the transport used for `ExecTarget::Local`.
    pub fn with_local(mut self, transport: Arc<dyn Transport>) -> Self {
        self.local = transport;
        self
    }

    pub fn with_remote(mut self, host: HostId, transport: Arc<dyn Transport>) -> Self {
        self.remotes.insert(host, transport);
        self
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    fn transport(&self, target: &ExecTarget) -> Result<&Arc<dyn Transport>, ExecError> {
        match target {
            ExecTarget::Local => Ok(&self.local),
            ExecTarget::Remote(host) => self
                .remotes
                .get(host)
                .ok_or_else(|| ExecError::UnknownHost(host.clone())),
        }
    }

    /// Run `script` on `target`, pushing each new log line to the sink as it appears.
    pub async fn execute(
        &self,
        script: &RunScript,
        target: &ExecTarget,
        run: &RunId,
        cancel: &CancelToken,
    ) -> Result<ExecOutcome, ExecError> {
        let transport = self.transport(target)?;
        tracing::debug!(run = %run, "Running script on {}", transport.describe());

        let mut follower = Follower {
            offset: transport.prepare_log(&script.log_path).await?,
            splitter: LineSplitter::default(),
            tail: OutputTail::new(self.settings.tail_lines),
        };

        // Fired on cancel or timeout so the transport tears the process down.
        let kill = CancelToken::new();
        let running = transport.run(&script.text, &script.log_path, &kill);
        tokio::pin!(running);

        let deadline = self.settings.run_timeout;
        let timer = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stopping: Option<ExecError> = None;
        let result = loop {
            tokio::select! {
                result = &mut running => break result,
                _ = ticker.tick() => {
                    self.follow(transport, &script.log_path, run, &mut follower).await;
                }
                _ = cancel.cancelled(), if stopping.is_none() => {
                    stopping = Some(ExecError::Cancelled);
                    kill.cancel();
                }
                _ = &mut timer, if stopping.is_none() => {
                    if let Some(limit) = deadline {
                        stopping = Some(ExecError::Timeout(limit));
                    }
                    kill.cancel();
                }
            }
        };

        self.follow(transport, &script.log_path, run, &mut follower).await;
        if let Some(line) = follower.splitter.finish() {
            self.emit(run, &line, &mut follower.tail);
        }

        if let Some(reason) = stopping {
            return Err(reason);
        }
        let exit_code = result?;
        Ok(ExecOutcome {
            exit_code,
            tail: follower.tail.into_lines(),
        })
    }

    async fn follow(&self, transport: &Arc<dyn Transport>, path: &str, run: &RunId, follower: &mut Follower) {
        match transport.read_log(path, follower.offset).await {
            Ok(bytes) if !bytes.is_empty() => {
                follower.offset += bytes.len() as u64;
                for line in follower.splitter.feed(&bytes) {
                    self.emit(run, &line, &mut follower.tail);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => tracing::debug!("Log read failed for {}: {}", path, e),
            Err(e) => tracing::warn!("Log read failed for {}: {}", path, e),
        }
    }

    fn emit(&self, run: &RunId, line: &str, tail: &mut OutputTail) {
        tail.push(line);
        self.sink.append(run, line);
    }
}

struct Follower {
    offset: u64,
    splitter: LineSplitter,
    tail: OutputTail,
}
