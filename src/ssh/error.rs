// ABOUTME: Errors from SSH sessions to build targets.
// ABOUTME: Connect and auth failures name the target; exec failures carry the channel step.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to {address}: {message}")]
    Connection { address: String, message: String },

    #[error("{user}@{address} rejected every offered key")]
    AuthenticationFailed { user: String, address: String },

    /// Neither an agent nor a default key under ~/.ssh could be used.
    #[error("no SSH credentials: {0}")]
    NoCredentials(String),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("failed to {step}: {message}")]
    Channel { step: &'static str, message: String },

    #[error("remote command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("remote command cancelled")]
    Cancelled,

    #[error("channel closed without an exit status")]
    ChannelClosed,

    #[error("engine socket forwarding failed: {0}")]
    SocketForward(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same command on a fresh session could succeed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::ChannelClosed
                | Error::Channel { .. }
                | Error::Protocol(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
