// ABOUTME: Local Unix socket that tunnels each connection to a remote socket over SSH.
// ABOUTME: Used to reach a remote Docker engine for swarm control-plane calls.

use super::client::SshHandler;
use super::error::{Error, Result};
use crate::cancel::CancelToken;
use russh::client::Handle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// A running socket tunnel. Dropping it stops accepting and removes the socket.
pub struct ForwardHandle {
    local_path: PathBuf,
    stop: CancelToken,
    task: Option<JoinHandle<()>>,
}

impl ForwardHandle {
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Local socket path, if it is valid UTF-8.
    pub fn path(&self) -> Option<&str> {
        self.local_path.to_str()
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        }
        let _ = std::fs::remove_file(&self.local_path);
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        let _ = std::fs::remove_file(&self.local_path);
    }
}

fn next_socket_path() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("rollout-{}-{}.sock", std::process::id(), n))
}

/// Bind a fresh local socket and tunnel every accepted connection to `remote_socket`.
pub async fn start_forward(
    handle: Arc<Handle<SshHandler>>,
    remote_socket: String,
) -> Result<ForwardHandle> {
    let local_path = next_socket_path();
    let _ = std::fs::remove_file(&local_path);

    let listener = UnixListener::bind(&local_path).map_err(|e| {
        Error::SocketForward(format!("failed to bind {}: {}", local_path.display(), e))
    })?;

    let stop = CancelToken::new();
    let task = tokio::spawn(accept_loop(listener, handle, remote_socket, stop.clone()));

    Ok(ForwardHandle {
        local_path,
        stop,
        task: Some(task),
    })
}

async fn accept_loop(
    listener: UnixListener,
    handle: Arc<Handle<SshHandler>>,
    remote_socket: String,
    stop: CancelToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stop.cancelled() => break,
        };
        match accepted {
            Ok((stream, _)) => {
                let handle = Arc::clone(&handle);
                let remote_socket = remote_socket.clone();
                tokio::spawn(async move {
                    if let Err(e) = tunnel(stream, &handle, &remote_socket).await {
                        tracing::debug!("Tunnel to {} closed: {}", remote_socket, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed on forwarded socket: {}", e);
                break;
            }
        }
    }
}

async fn tunnel(mut local: UnixStream, handle: &Handle<SshHandler>, remote_socket: &str) -> Result<()> {
    let channel = handle
        .channel_open_direct_streamlocal(remote_socket)
        .await
        .map_err(|e| {
            Error::SocketForward(format!("failed to open channel to {}: {}", remote_socket, e))
        })?;
    let mut remote = channel.into_stream();
    tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    Ok(())
}
