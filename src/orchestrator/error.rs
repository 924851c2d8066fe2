// ABOUTME: Adapter error types with SNAFU context selectors.
// ABOUTME: Capability errors are raised before any platform call; the rest carry platform messages.

use snafu::Snafu;

use super::{Capability, OrchestratorKind};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AdapterError {
    #[snafu(display("{platform} cannot express {}", list(gaps)))]
    Capability {
        platform: OrchestratorKind,
        gaps: Vec<Capability>,
    },

    #[snafu(display("failed to apply {resource}: {message}"))]
    Apply { resource: String, message: String },

    #[snafu(display("invalid {field} quantity {value:?}"))]
    Quantity { field: &'static str, value: String },

    #[snafu(display("cannot reach {platform}: {message}"))]
    Connection {
        platform: OrchestratorKind,
        message: String,
    },

    #[snafu(display("failed to read {resource}: {message}"))]
    Describe { resource: String, message: String },

    #[snafu(display("failed to remove {resource}: {message}"))]
    Remove { resource: String, message: String },
}

fn list(gaps: &[Capability]) -> String {
    gaps.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Descriptor asks for a feature the platform lacks.
    Capability,
    /// Platform rejected or failed to materialize a resource.
    Apply,
    /// A resource quantity could not be parsed for the platform.
    Quantity,
    /// Control plane unreachable.
    Connection,
    Describe,
    Remove,
}

impl AdapterError {
    pub fn kind(&self) -> AdapterErrorKind {
        match self {
            AdapterError::Capability { .. } => AdapterErrorKind::Capability,
            AdapterError::Apply { .. } => AdapterErrorKind::Apply,
            AdapterError::Quantity { .. } => AdapterErrorKind::Quantity,
            AdapterError::Connection { .. } => AdapterErrorKind::Connection,
            AdapterError::Describe { .. } => AdapterErrorKind::Describe,
            AdapterError::Remove { .. } => AdapterErrorKind::Remove,
        }
    }

    /// The features that could not be expressed, for capability errors.
    pub fn capability_gaps(&self) -> Option<&[Capability]> {
        match self {
            AdapterError::Capability { gaps, .. } => Some(gaps),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_error_lists_every_gap() {
        let err = CapabilitySnafu {
            platform: OrchestratorKind::Swarm,
            gaps: vec![Capability::Autoscaling, Capability::NetworkPolicy],
        }
        .build();
        assert_eq!(err.kind(), AdapterErrorKind::Capability);
        assert_eq!(
            err.to_string(),
            "swarm cannot express horizontal autoscaling, network policy"
        );
    }

    #[test]
    fn quantity_error_quotes_the_value() {
        let err = QuantitySnafu {
            field: "cpu",
            value: "lots",
        }
        .build();
        assert_eq!(err.to_string(), "invalid cpu quantity \"lots\"");
        assert!(err.capability_gaps().is_none());
    }
}
