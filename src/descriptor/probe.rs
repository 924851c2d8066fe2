// ABOUTME: Health probe with exactly one check kind plus timing.
// ABOUTME: The wire form keeps three optional keys; parsing rejects ambiguous probes.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::DescriptorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpScheme {
    #[default]
    Http,
    Https,
}

impl HttpScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpScheme::Http => "http",
            HttpScheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCheck {
    Http {
        path: String,
        port: u16,
        scheme: HttpScheme,
    },
    Tcp {
        port: u16,
    },
    Exec(NonEmpty<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawProbe", into = "RawProbe")]
pub struct ProbeConfig {
    pub check: ProbeCheck,
    pub initial_delay: Duration,
    pub period: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl ProbeConfig {
    /// Probe with default timing for the given check.
    pub fn new(check: ProbeCheck) -> Self {
        Self {
            check,
            initial_delay: Duration::ZERO,
            period: default_period(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }

    pub fn http(path: impl Into<String>, port: u16) -> Self {
        Self::new(ProbeCheck::Http {
            path: path.into(),
            port,
            scheme: HttpScheme::Http,
        })
    }

    /// Longest time a platform may take before giving up on a fresh replica.
    pub fn failure_budget(&self) -> Duration {
        self.initial_delay + self.period * self.failure_threshold
    }

    pub(super) fn validate(&self) -> Result<(), DescriptorError> {
        if self.failure_threshold == 0 {
            return Err(DescriptorError::ProbeThreshold);
        }
        if self.period.is_zero() {
            return Err(DescriptorError::ProbePeriod);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HttpCheck {
    path: String,
    port: u16,
    #[serde(default)]
    scheme: HttpScheme,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TcpCheck {
    port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http: Option<HttpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tcp: Option<TcpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exec: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde")]
    initial_delay: Duration,
    #[serde(default = "default_period", with = "humantime_serde")]
    period: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    failure_threshold: u32,
}

fn default_period() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

impl TryFrom<RawProbe> for ProbeConfig {
    type Error = DescriptorError;

    fn try_from(raw: RawProbe) -> Result<Self, Self::Error> {
        let populated = [raw.http.is_some(), raw.tcp.is_some(), raw.exec.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if populated != 1 {
            return Err(DescriptorError::AmbiguousProbe(populated));
        }

        let check = match (raw.http, raw.tcp, raw.exec) {
            (Some(http), None, None) => ProbeCheck::Http {
                path: http.path,
                port: http.port,
                scheme: http.scheme,
            },
            (None, Some(tcp), None) => ProbeCheck::Tcp { port: tcp.port },
            (None, None, Some(argv)) => {
                ProbeCheck::Exec(NonEmpty::from_vec(argv).ok_or(DescriptorError::EmptyExecProbe)?)
            }
            _ => return Err(DescriptorError::AmbiguousProbe(populated)),
        };

        let probe = ProbeConfig {
            check,
            initial_delay: raw.initial_delay,
            period: raw.period,
            timeout: raw.timeout,
            failure_threshold: raw.failure_threshold,
        };
        probe.validate()?;
        Ok(probe)
    }
}

impl From<ProbeConfig> for RawProbe {
    fn from(probe: ProbeConfig) -> Self {
        let mut raw = RawProbe {
            http: None,
            tcp: None,
            exec: None,
            initial_delay: probe.initial_delay,
            period: probe.period,
            timeout: probe.timeout,
            failure_threshold: probe.failure_threshold,
        };
        match probe.check {
            ProbeCheck::Http { path, port, scheme } => {
                raw.http = Some(HttpCheck { path, port, scheme })
            }
            ProbeCheck::Tcp { port } => raw.tcp = Some(TcpCheck { port }),
            ProbeCheck::Exec(argv) => raw.exec = Some(argv.into()),
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_probe_parses_with_defaults() {
        let probe: ProbeConfig = serde_yaml::from_str(
            r#"
http:
  path: /health
  port: 3000
"#,
        )
        .unwrap();
        assert_eq!(
            probe.check,
            ProbeCheck::Http {
                path: "/health".to_string(),
                port: 3000,
                scheme: HttpScheme::Http
            }
        );
        assert_eq!(probe.period, Duration::from_secs(10));
        assert_eq!(probe.failure_threshold, 3);
    }

    #[test]
    fn two_check_kinds_are_ambiguous() {
        let err = serde_yaml::from_str::<ProbeConfig>(
            r#"
http:
  path: /
  port: 80
tcp:
  port: 80
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ambiguous probe"));
    }

    #[test]
    fn missing_check_kind_is_ambiguous() {
        let err = serde_yaml::from_str::<ProbeConfig>("period: 5s").unwrap_err();
        assert!(err.to_string().contains("found 0"));
    }

    #[test]
    fn empty_exec_is_rejected() {
        let err = serde_yaml::from_str::<ProbeConfig>("exec: []").unwrap_err();
        assert!(err.to_string().contains("exec probe"));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = serde_yaml::from_str::<ProbeConfig>(
            r#"
tcp:
  port: 5432
failure_threshold: 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn failure_budget_adds_delay_and_retries() {
        let mut probe = ProbeConfig::http("/", 80);
        probe.initial_delay = Duration::from_secs(5);
        probe.period = Duration::from_secs(2);
        probe.failure_threshold = 4;
        assert_eq!(probe.failure_budget(), Duration::from_secs(13));
    }

    #[test]
    fn serialized_form_keeps_single_key() {
        let probe = ProbeConfig::new(ProbeCheck::Tcp { port: 6379 });
        let value = serde_json::to_value(&probe).unwrap();
        assert!(value.get("tcp").is_some());
        assert!(value.get("http").is_none());
        assert!(value.get("exec").is_none());
    }
}
