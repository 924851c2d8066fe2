// ABOUTME: Transport that runs scripts on a remote host over an SSH session.
// ABOUTME: The remote shell records its PID next to the log so cancellation can kill it.

use async_trait::async_trait;
use std::sync::Arc;

use super::{ExecError, Transport};
use crate::build::quote;
use crate::cancel::CancelToken;
use crate::ssh::{Error as SshError, Session};
use crate::types::HostId;

pub struct SshTransport {
    host: HostId,
    session: Arc<Session>,
}

impl SshTransport {
    pub fn new(host: HostId, session: Arc<Session>) -> Self {
        Self { host, session }
    }

    fn pid_file(log_path: &str) -> String {
        format!("{}.pid", log_path)
    }

    async fn terminate(&self, log_path: &str) {
        let pid_file = quote(&Self::pid_file(log_path));
        let command = format!(
            "pid=$(cat {pid}) && pkill -TERM -P \"$pid\"; kill -TERM \"$pid\"; rm -f {pid}",
            pid = pid_file
        );
        if let Err(e) = self.session.exec(&command).await {
            tracing::warn!("Failed to terminate remote script on {}: {}", self.host, e);
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn describe(&self) -> String {
        self.host.to_string()
    }

    async fn prepare_log(&self, path: &str) -> Result<u64, ExecError> {
        let path = quote(path);
        let output = self
            .session
            .exec(&format!(
                "mkdir -p \"$(dirname {p})\" && touch {p} && wc -c < {p}",
                p = path
            ))
            .await?;
        if !output.success() {
            return Err(ExecError::Log(format!(
                "failed to prepare {}: {}",
                path,
                output.stderr.trim()
            )));
        }
        output
            .stdout
            .trim()
            .parse()
            .map_err(|_| ExecError::Log(format!("unexpected size for {}: {}", path, output.stdout)))
    }

    async fn run(&self, script: &str, log_path: &str, cancel: &CancelToken) -> Result<i32, ExecError> {
        let pid_file = Self::pid_file(log_path);
        let command = format!(
            "echo $$ > {}; exec sh -c {}",
            quote(&pid_file),
            quote(script)
        );
        match self.session.exec_cancellable(&command, cancel).await {
            Ok(output) => {
                let _ = self.session.exec(&format!("rm -f {}", quote(&pid_file))).await;
                Ok(output.exit_code as i32)
            }
            Err(SshError::Cancelled) => {
                self.terminate(log_path).await;
                Err(ExecError::Cancelled)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_log(&self, path: &str, offset: u64) -> Result<Vec<u8>, ExecError> {
        let output = self
            .session
            .exec(&format!("tail -c +{} {}", offset + 1, quote(path)))
            .await?;
        if !output.success() {
            return Err(ExecError::Log(format!(
                "failed to read {}: {}",
                path,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.into_bytes())
    }
}
