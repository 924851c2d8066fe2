// ABOUTME: Transport that runs scripts as local child processes.
// ABOUTME: Each script gets its own process group so cancellation reaches the whole tree.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;

use super::{ExecError, Transport};
use crate::cancel::CancelToken;

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn prepare_log(&self, path: &str) -> Result<u64, ExecError> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| ExecError::Log(format!("{}: {}", path, e)))?;
        Ok(file.metadata().await?.len())
    }

    async fn run(&self, script: &str, _log_path: &str, cancel: &CancelToken) -> Result<i32, ExecError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                Ok(status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
            }
            _ = cancel.cancelled() => {
                if let Some(pid) = child.id() {
                    tracing::debug!("Terminating process group {}", pid);
                    let _ = Command::new("kill")
                        .args(["-TERM", "--", &format!("-{}", pid)])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status()
                        .await;
                }
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ExecError::Cancelled)
            }
        }
    }

    async fn read_log(&self, path: &str, offset: u64) -> Result<Vec<u8>, ExecError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ExecError::Log(format!("{}: {}", path, e)))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}
