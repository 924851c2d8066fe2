// ABOUTME: Horizontal autoscaling policy for a workload.
// ABOUTME: Bounds, utilization targets, and optional scale-up/scale-down behavior.

use serde::{Deserialize, Serialize};

use super::DescriptorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpaConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Workload the autoscaler drives. Defaults to the descriptor name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Average CPU utilization percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu: Option<u32>,
    /// Average memory utilization percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_memory: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<HpaBehavior>,
}

fn default_enabled() -> bool {
    true
}

impl HpaConfig {
    pub(super) fn validate(&self) -> Result<(), DescriptorError> {
        if !self.enabled {
            return Ok(());
        }
        if self.min_replicas > self.max_replicas {
            return Err(DescriptorError::AutoscalingBounds {
                min: self.min_replicas,
                max: self.max_replicas,
            });
        }
        if self.target_cpu.is_none() && self.target_memory.is_none() {
            return Err(DescriptorError::AutoscalingTarget);
        }
        for target in [self.target_cpu, self.target_memory].into_iter().flatten() {
            if !(1..=100).contains(&target) {
                return Err(DescriptorError::AutoscalingPercent(target));
            }
        }
        Ok(())
    }

    /// Clamp a requested replica count into the autoscaler's bounds.
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpaBehavior {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up: Option<ScalingRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down: Option<ScalingRules>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization_window_secs: Option<u32>,
    #[serde(default)]
    pub policies: Vec<ScalingPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub kind: ScalingPolicyKind,
    pub value: u32,
    pub period_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingPolicyKind {
    Pods,
    Percent,
}

impl ScalingPolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingPolicyKind::Pods => "Pods",
            ScalingPolicyKind::Percent => "Percent",
        }
    }
}
