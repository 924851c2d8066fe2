// ABOUTME: Where clone and build scripts run: the local machine or an SSH host.
// ABOUTME: Parses "local", "host", "user@host", "host:port", and "user@host:port".

use serde::Deserialize;
use std::path::PathBuf;

use crate::executor::ExecTarget;
use crate::ssh::SessionConfig;
use crate::types::HostId;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    Local,
    Remote(RemoteHost),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteHost {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    /// Private key; the agent and default key paths are tried when unset.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub trust_first_connection: bool,
}

fn default_port() -> u16 {
    22
}

impl RemoteHost {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("target address cannot be empty".to_string());
        }

        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if user.is_empty() => {
                return Err(format!("empty user in target `{}`", rest));
            }
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, s),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: {}", port))?;
                (host, port)
            }
            None => (rest, default_port()),
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }

        Ok(RemoteHost {
            host: host.to_string(),
            port,
            user,
            key_path: None,
            trust_first_connection: false,
        })
    }

    /// Identity the executor keys this host's transport by.
    pub fn host_id(&self) -> HostId {
        HostId::new(format!("{}:{}", self.host, self.port))
    }

    /// SSH session parameters. `default_user` fills in a missing `user`.
    pub fn session_config(&self, default_user: &str) -> SessionConfig {
        let user = self.user.as_deref().unwrap_or(default_user);
        let mut config = SessionConfig::new(&self.host, user)
            .port(self.port)
            .trust_on_first_use(self.trust_first_connection);
        if let Some(key) = &self.key_path {
            config = config.key_path(key);
        }
        config
    }
}

impl Target {
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.trim() == "local" {
            Ok(Target::Local)
        } else {
            RemoteHost::parse(s).map(Target::Remote)
        }
    }

    pub fn exec_target(&self) -> ExecTarget {
        match self {
            Target::Local => ExecTarget::Local,
            Target::Remote(host) => ExecTarget::Remote(host.host_id()),
        }
    }

    pub fn remote(&self) -> Option<&RemoteHost> {
        match self {
            Target::Local => None,
            Target::Remote(host) => Some(host),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Remote(host) => match &host.user {
                Some(user) => write!(f, "{}@{}:{}", user, host.host, host.port),
                None => write!(f, "{}:{}", host.host, host.port),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_keyword() {
        assert_eq!(Target::parse("local").unwrap(), Target::Local);
        assert_eq!(Target::Local.exec_target(), ExecTarget::Local);
    }

    #[test]
    fn full_address() {
        let target = Target::parse("deploy@build.example.com:2222").unwrap();
        let host = target.remote().unwrap();
        assert_eq!(host.user.as_deref(), Some("deploy"));
        assert_eq!(host.host, "build.example.com");
        assert_eq!(host.port, 2222);
        assert_eq!(target.to_string(), "deploy@build.example.com:2222");
    }

    #[test]
    fn bare_host_uses_port_22() {
        let host = RemoteHost::parse("builder").unwrap();
        assert_eq!(host.port, 22);
        assert_eq!(host.user, None);
        assert_eq!(host.host_id().as_str(), "builder:22");
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(RemoteHost::parse("").is_err());
        assert!(RemoteHost::parse("host:notaport").is_err());
        assert!(RemoteHost::parse("@host").is_err());
        assert!(RemoteHost::parse("user@:22").is_err());
    }

    #[test]
    fn session_config_falls_back_to_default_user() {
        let config = RemoteHost::parse("builder:2200")
            .unwrap()
            .session_config("ci");
        assert_eq!(config.user, "ci");
        assert_eq!(config.port, 2200);
        assert!(!config.trust_on_first_use);
    }
}
