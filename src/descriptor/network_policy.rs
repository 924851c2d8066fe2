// ABOUTME: Network policy describing which peers may reach a workload and where it may connect.
// ABOUTME: Selector and port semantics follow the cluster backend's policy objects.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub pod_selector: BTreeMap<String, String>,
    pub policy_types: NonEmpty<PolicyType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<NetworkPolicyRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkPolicyRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Ingress => "Ingress",
            PolicyType::Egress => "Egress",
        }
    }
}

/// One allow rule. For ingress the peers are sources, for egress destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyRule {
    #[serde(default, alias = "from", alias = "to", skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<NetworkPolicyPeer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyPeer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlock {
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortRef>,
}

/// A port given by number or by container port name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_with_from_alias() {
        let policy: NetworkPolicyConfig = serde_yaml::from_str(
            r#"
name: web-allow
policy_types: [Ingress]
ingress:
  - from:
      - pod_selector: { role: frontend }
      - ip_block: { cidr: 10.0.0.0/8, except: [10.1.0.0/16] }
    ports:
      - protocol: tcp
        port: 8080
"#,
        )
        .unwrap();
        assert_eq!(policy.policy_types.head, PolicyType::Ingress);
        let rule = &policy.ingress[0];
        assert_eq!(rule.peers.len(), 2);
        assert_eq!(rule.ports[0].port, Some(PortRef::Number(8080)));
        assert_eq!(
            rule.peers[1].ip_block.as_ref().unwrap().except,
            vec!["10.1.0.0/16".to_string()]
        );
    }

    #[test]
    fn policy_types_cannot_be_empty() {
        let result = serde_yaml::from_str::<NetworkPolicyConfig>(
            r#"
name: none
policy_types: []
"#,
        );
        assert!(result.is_err());
    }
}
