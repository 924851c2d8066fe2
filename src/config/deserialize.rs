// ABOUTME: Custom serde deserializers for config shorthands.
// ABOUTME: Accepts targets and ports either as compact strings or as full maps.

use nonempty::NonEmpty;
use serde::Deserialize;

use super::target::{RemoteHost, Target};
use crate::descriptor::{Port, Protocol, PublishMode};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Simple(String),
    Detailed(RemoteHost),
}

impl TargetEntry {
    fn into_target(self) -> Result<Target, String> {
        match self {
            TargetEntry::Simple(s) => Target::parse(&s),
            TargetEntry::Detailed(host) => Ok(Target::Remote(host)),
        }
    }
}

pub fn deserialize_target<'de, D>(deserializer: D) -> Result<Target, D::Error>
where
    D: serde::Deserializer<'de>,
{
    TargetEntry::deserialize(deserializer)?
        .into_target()
        .map_err(serde::de::Error::custom)
}

pub fn deserialize_target_option<'de, D>(deserializer: D) -> Result<Option<Target>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<TargetEntry>::deserialize(deserializer)?
        .map(TargetEntry::into_target)
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Number(u16),
    Simple(String),
    Detailed(Port),
}

/// Parse `"8080"`, `"80:8080"`, or either with a `/udp` suffix.
fn parse_port(s: &str) -> Result<Port, String> {
    let (spec, protocol) = match s.trim().rsplit_once('/') {
        Some((spec, "tcp")) => (spec, Protocol::Tcp),
        Some((spec, "udp")) => (spec, Protocol::Udp),
        Some((_, other)) => return Err(format!("unknown protocol: {}", other)),
        None => (s.trim(), Protocol::Tcp),
    };
    let number = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| format!("invalid port: {}", p))
    };
    let (published_port, container_port) = match spec.split_once(':') {
        Some((published, container)) => (Some(number(published)?), number(container)?),
        None => (None, number(spec)?),
    };
    Ok(Port {
        container_port,
        protocol,
        published_port,
        publish_mode: PublishMode::Ingress,
    })
}

pub fn deserialize_ports<'de, D>(deserializer: D) -> Result<Vec<Port>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries: Vec<PortEntry> = Vec::deserialize(deserializer)?;
    entries
        .into_iter()
        .map(|entry| match entry {
            PortEntry::Number(n) => Ok(Port::tcp(n)),
            PortEntry::Simple(s) => parse_port(&s),
            PortEntry::Detailed(port) => Ok(port),
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(serde::de::Error::custom)
}

pub fn deserialize_command<'de, D>(deserializer: D) -> Result<Option<NonEmpty<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<Vec<String>> = Option::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(words) => NonEmpty::from_vec(words)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("command cannot be an empty list")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_shorthands() {
        assert_eq!(parse_port("8080").unwrap(), Port::tcp(8080));

        let mapped = parse_port("80:8080").unwrap();
        assert_eq!(mapped.published_port, Some(80));
        assert_eq!(mapped.container_port, 8080);

        let udp = parse_port("53/udp").unwrap();
        assert_eq!(udp.protocol, Protocol::Udp);
    }

    #[test]
    fn port_rejects_garbage() {
        assert!(parse_port("http").is_err());
        assert!(parse_port("80/sctp").is_err());
        assert!(parse_port("99999").is_err());
    }
}
