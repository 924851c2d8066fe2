// ABOUTME: SSH session management using russh.
// ABOUTME: Connects with agent or key auth, runs remote commands, and forwards sockets.

use super::error::{Error, Result};
use super::forward::{ForwardHandle, start_forward};
use crate::cancel::CancelToken;
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

/// Configuration for establishing an SSH session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    pub user: String,
    /// Private key file. When None the agent is tried, then default key paths.
    pub key_path: Option<PathBuf>,
    /// Accept and remember hosts missing from known_hosts.
    pub trust_on_first_use: bool,
    /// Defaults to ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// Timeout for short control commands (default: 5 minutes).
    /// Long-running scripts go through `exec_cancellable` instead.
    pub command_timeout: Duration,
    /// Idle time after which the connection is dropped (default: 10 minutes).
    pub inactivity_timeout: Duration,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: None,
            trust_on_first_use: false,
            known_hosts_path: None,
            command_timeout: Duration::from_secs(300),
            inactivity_timeout: Duration::from_secs(600),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

/// Output from a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// russh callback handler; only host key verification is customised.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
}

impl SshHandler {
    fn remember(&self, key: &ssh_key::PublicKey) {
        let learned = match &self.known_hosts_path {
            Some(path) => learn_known_hosts_path(&self.host, self.port, key, path),
            None => learn_known_hosts(&self.host, self.port, key),
        };
        if let Err(e) = learned {
            tracing::warn!("Failed to save host key for {}: {}", self.host, e);
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        Ok(match known {
            Ok(true) => true,
            // A changed key is never accepted, even with TOFU.
            Err(russh::keys::Error::KeyChanged { .. }) => false,
            Ok(false) if self.trust_on_first_use => {
                tracing::warn!(
                    "Trust-On-First-Use: accepting new host key for {}:{}",
                    self.host,
                    self.port
                );
                self.remember(server_public_key);
                true
            }
            Ok(false) => false,
            Err(_) => self.trust_on_first_use,
        })
    }
}

enum Credentials {
    Agent(AgentClient<UnixStream>),
    Key(Arc<ssh_key::PrivateKey>),
}

impl Credentials {
    async fn resolve(config: &SessionConfig) -> Result<Self> {
        if let Some(path) = &config.key_path {
            let key = load_secret_key(path, None).map_err(|e| Error::KeyLoadFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            return Ok(Credentials::Key(Arc::new(key)));
        }

        if let Ok(agent) = AgentClient::connect_env().await {
            return Ok(Credentials::Agent(agent));
        }

        let home = std::env::var("HOME").map_err(|_| {
            Error::NoCredentials("no agent and HOME is not set".to_string())
        })?;
        ["id_ed25519", "id_rsa", "id_ecdsa"]
            .iter()
            .find_map(|name| load_secret_key(format!("{}/.ssh/{}", home, name), None).ok())
            .map(|key| Credentials::Key(Arc::new(key)))
            .ok_or_else(|| {
                Error::NoCredentials("no agent and no default keys in ~/.ssh".to_string())
            })
    }

    async fn authenticate(self, handle: &mut Handle<SshHandler>, user: &str) -> Result<bool> {
        match self {
            Credentials::Agent(mut agent) => {
                let keys = agent.request_identities().await.map_err(|e| {
                    Error::NoCredentials(format!("failed to list agent keys: {}", e))
                })?;
                if keys.is_empty() {
                    return Err(Error::NoCredentials("agent holds no keys".to_string()));
                }
                for key in keys {
                    if let Ok(result) = handle
                        .authenticate_publickey_with(user, key, None, &mut agent)
                        .await
                        && result.success()
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Credentials::Key(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let result = handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await?;
                Ok(result.success())
            }
        }
    }
}

/// An established SSH session.
pub struct Session {
    config: SessionConfig,
    handle: Arc<Handle<SshHandler>>,
    forwarders: Mutex<Vec<ForwardHandle>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let credentials = Credentials::resolve(&config).await?;

        let russh_config = Config {
            inactivity_timeout: Some(config.inactivity_timeout),
            ..Default::default()
        };
        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            trust_on_first_use: config.trust_on_first_use,
            known_hosts_path: config.known_hosts_path.clone(),
        };

        let mut handle = client::connect(
            Arc::new(russh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await
        .map_err(|e| Error::Connection {
            address: format!("{}:{}", config.host, config.port),
            message: e.to_string(),
        })?;

        if !credentials.authenticate(&mut handle, &config.user).await? {
            return Err(Error::AuthenticationFailed {
                user: config.user.clone(),
                address: format!("{}:{}", config.host, config.port),
            });
        }
        tracing::debug!("SSH session established to {}:{}", config.host, config.port);

        Ok(Self {
            config,
            handle: Arc::new(handle),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// `user@host:port` of this session.
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.config.user, self.config.host, self.config.port)
    }

    /// Run a short command under the configured command timeout.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let limit = self.config.command_timeout;
        tokio::time::timeout(limit, self.exec_inner(command))
            .await
            .map_err(|_| Error::CommandTimeout(limit))?
    }

    /// Run a command with no timeout, abandoning it when `cancel` fires.
    ///
    /// The remote process is not signalled; callers that need it gone must
    /// kill it themselves.
    pub async fn exec_cancellable(
        &self,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<CommandOutput> {
        tokio::select! {
            result = self.exec_inner(command) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn exec_inner(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Channel {
                step: "open channel",
                message: e.to_string(),
            })?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Channel {
                step: "start command",
                message: e.to_string(),
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        let mut eof = false;

        // Exit status and EOF may arrive in either order; both are needed.
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                    if eof {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    eof = true;
                    if exit_code.is_some() {
                        break;
                    }
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or(Error::ChannelClosed)?;
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Expose a remote Unix socket locally; returns the local socket path.
    pub async fn forward_socket(&self, remote_socket: &str) -> Result<String> {
        let forward = start_forward(Arc::clone(&self.handle), remote_socket.to_string()).await?;
        let path = forward
            .path()
            .ok_or_else(|| Error::SocketForward("socket path is not valid UTF-8".to_string()))?
            .to_string();
        self.forwarders.lock().push(forward);
        Ok(path)
    }

    /// Stop forwarders and close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        let forwarders: Vec<_> = self.forwarders.lock().drain(..).collect();
        for forward in forwarders {
            forward.stop().await;
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
