// ABOUTME: Container-level descriptor pieces: ports, volume mounts, and resources.
// ABOUTME: Quantities stay opaque strings; adapters parse them for their platform.

use serde::{Deserialize, Serialize};

use super::DescriptorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// How a published port is exposed on a swarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Ingress,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_port: Option<u16>,
    #[serde(default)]
    pub publish_mode: PublishMode,
}

impl Port {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            protocol: Protocol::Tcp,
            published_port: None,
            publish_mode: PublishMode::Ingress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
    /// Persistent claim backing the mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl Volume {
    pub(super) fn validate(&self) -> Result<(), DescriptorError> {
        if !self.mount_path.starts_with('/') {
            return Err(DescriptorError::RelativeMountPath(self.mount_path.clone()));
        }
        if self.claim.is_some() && self.host_path.is_some() {
            return Err(DescriptorError::VolumeSource(self.name.clone()));
        }
        Ok(())
    }
}

/// One side of a request/limit pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceSet {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }

    fn validate(&self, cpu_field: &'static str, memory_field: &'static str) -> Result<(), DescriptorError> {
        if self.cpu.as_deref().is_some_and(|v| v.trim().is_empty()) {
            return Err(DescriptorError::EmptyQuantity { field: cpu_field });
        }
        if self.memory.as_deref().is_some_and(|v| v.trim().is_empty()) {
            return Err(DescriptorError::EmptyQuantity {
                field: memory_field,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceSet,
    #[serde(default)]
    pub limits: ResourceSet,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }

    pub(super) fn validate(&self) -> Result<(), DescriptorError> {
        self.requests.validate("requests.cpu", "requests.memory")?;
        self.limits.validate("limits.cpu", "limits.memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_mount_path_is_rejected() {
        let volume = Volume {
            name: "data".to_string(),
            mount_path: "data".to_string(),
            claim: None,
            host_path: None,
            read_only: false,
        };
        assert_eq!(
            volume.validate(),
            Err(DescriptorError::RelativeMountPath("data".to_string()))
        );
    }

    #[test]
    fn blank_quantity_is_rejected() {
        let resources = ResourceRequirements {
            requests: ResourceSet {
                cpu: Some(" ".to_string()),
                memory: None,
            },
            limits: ResourceSet::default(),
        };
        assert_eq!(
            resources.validate(),
            Err(DescriptorError::EmptyQuantity {
                field: "requests.cpu"
            })
        );
    }

    #[test]
    fn port_defaults_from_yaml() {
        let port: Port = serde_yaml::from_str("container_port: 8080").unwrap();
        assert_eq!(port, Port::tcp(8080));
    }
}
