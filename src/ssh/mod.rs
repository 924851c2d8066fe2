// ABOUTME: SSH sessions to build targets and swarm managers.
// ABOUTME: Runs remote shell commands and forwards the engine socket for bollard.

mod client;
mod error;
mod forward;

pub use client::{CommandOutput, Session, SessionConfig};
pub use error::{Error, Result};
