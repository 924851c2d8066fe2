// ABOUTME: Rollout strategy for replacing running replicas.
// ABOUTME: Rolling updates take surge/unavailable bounds as counts or percentages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::DescriptorError;

/// A replica count given either absolutely or as a share of the desired count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawIntOrPercent", into = "RawIntOrPercent")]
pub enum IntOrPercent {
    Int(u32),
    Percent(u32),
}

impl IntOrPercent {
    pub fn parse(input: &str) -> Result<Self, DescriptorError> {
        let input = input.trim();
        let invalid = || DescriptorError::IntOrPercent(input.to_string());
        match input.strip_suffix('%') {
            Some(number) => number.trim().parse().map(Self::Percent).map_err(|_| invalid()),
            None => input.parse().map(Self::Int).map_err(|_| invalid()),
        }
    }

    /// Absolute count against `total` replicas, rounding percentages up.
    pub fn resolve(&self, total: u32) -> u32 {
        match *self {
            IntOrPercent::Int(n) => n,
            IntOrPercent::Percent(p) => (u64::from(p) * u64::from(total)).div_ceil(100) as u32,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match *self {
            IntOrPercent::Int(n) => serde_json::Value::from(n),
            IntOrPercent::Percent(_) => serde_json::Value::from(self.to_string()),
        }
    }
}

impl fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrPercent::Int(n) => write!(f, "{}", n),
            IntOrPercent::Percent(p) => write!(f, "{}%", p),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawIntOrPercent {
    Int(u32),
    Text(String),
}

impl TryFrom<RawIntOrPercent> for IntOrPercent {
    type Error = DescriptorError;

    fn try_from(raw: RawIntOrPercent) -> Result<Self, Self::Error> {
        match raw {
            RawIntOrPercent::Int(n) => Ok(IntOrPercent::Int(n)),
            RawIntOrPercent::Text(s) => IntOrPercent::parse(&s),
        }
    }
}

impl From<IntOrPercent> for RawIntOrPercent {
    fn from(value: IntOrPercent) -> Self {
        match value {
            IntOrPercent::Int(n) => RawIntOrPercent::Int(n),
            IntOrPercent::Percent(_) => RawIntOrPercent::Text(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RolloutStrategy {
    Rolling {
        #[serde(default = "default_bound")]
        max_surge: IntOrPercent,
        #[serde(default = "default_bound")]
        max_unavailable: IntOrPercent,
        /// How long each updated batch is watched before moving on.
        #[serde(default = "default_monitor", with = "humantime_serde")]
        monitor: Duration,
    },
    Recreate,
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        RolloutStrategy::Rolling {
            max_surge: default_bound(),
            max_unavailable: default_bound(),
            monitor: default_monitor(),
        }
    }
}

fn default_bound() -> IntOrPercent {
    IntOrPercent::Percent(25)
}

fn default_monitor() -> Duration {
    Duration::from_secs(5)
}
