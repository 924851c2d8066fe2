// ABOUTME: Scheduling hints passed through to the platform scheduler.
// ABOUTME: Constraints, spread preferences, platform filters, and replication mode.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Expressions like `node.role==manager` or `node.labels.zone==a`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    /// Spread descriptors like `node.labels.zone`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas_per_node: Option<u64>,
}

impl Placement {
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
            && self.preferences.is_empty()
            && self.platforms.is_empty()
            && self.max_replicas_per_node.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

/// A node-label equality constraint, the one form both backends can express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelConstraint<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

/// Parse `node.labels.KEY==VALUE`. Any other constraint form yields None.
pub fn label_constraint(expr: &str) -> Option<LabelConstraint<'_>> {
    let (lhs, rhs) = expr.split_once("==")?;
    let key = lhs.trim().strip_prefix("node.labels.")?;
    let value = rhs.trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some(LabelConstraint { key, value })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadMode {
    /// A fixed number of replicas.
    #[default]
    Replicated,
    /// One replica on every eligible node.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdbConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_constraints_parse() {
        assert_eq!(
            label_constraint("node.labels.zone == eu-1"),
            Some(LabelConstraint {
                key: "zone",
                value: "eu-1"
            })
        );
    }

    #[test]
    fn other_constraint_forms_do_not_parse() {
        assert_eq!(label_constraint("node.role==manager"), None);
        assert_eq!(label_constraint("node.labels.zone!=eu-1"), None);
        assert_eq!(label_constraint("node.labels.==x"), None);
    }
}
