// ABOUTME: Builds the configured adapter once, at pipeline construction.
// ABOUTME: Swarm engines are reached locally or over SSH; clusters through kubeconfig.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::cluster::{ClusterAdapter, ClusterSettings, DEFAULT_NAMESPACE, KubeCluster};
use super::swarm::{DEFAULT_NETWORK, DockerSwarm, SwarmAdapter, SwarmSettings};
use super::{AdapterError, CapabilityPolicy, OrchestratorAdapter};
use crate::ssh::Session;

/// Which backend to drive, with its connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrchestratorSettings {
    Swarm {
        /// Engine socket, on the target host.
        #[serde(default = "default_socket")]
        socket: String,
        #[serde(default = "default_network")]
        network: String,
    },
    Cluster {
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kubeconfig: Option<PathBuf>,
    },
}

fn default_socket() -> String {
    super::swarm::DOCKER_SOCKET.to_string()
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings::Swarm {
            socket: default_socket(),
            network: default_network(),
        }
    }
}

/// Connect the configured backend. A swarm engine on a remote target is reached by
/// forwarding its socket over `session`.
pub async fn connect(
    settings: &OrchestratorSettings,
    capabilities: CapabilityPolicy,
    session: Option<Arc<Session>>,
) -> Result<Arc<dyn OrchestratorAdapter>, AdapterError> {
    match settings {
        OrchestratorSettings::Swarm { socket, network } => {
            let (engine, endpoint) = match session {
                Some(session) => {
                    let endpoint = format!("ssh://{}{}", session.address(), socket);
                    (DockerSwarm::connect_via_session(session, socket).await?, endpoint)
                }
                None => (DockerSwarm::connect_local(socket)?, format!("unix://{}", socket)),
            };
            let adapter = SwarmAdapter::new(
                Arc::new(engine),
                SwarmSettings {
                    network: network.clone(),
                    capabilities,
                    endpoint: Some(endpoint),
                },
            );
            Ok(Arc::new(adapter))
        }
        OrchestratorSettings::Cluster {
            namespace,
            context,
            kubeconfig,
        } => {
            let client = KubeCluster::connect(kubeconfig.as_deref(), context.as_deref()).await?;
            let adapter = ClusterAdapter::new(
                Arc::new(client),
                ClusterSettings {
                    namespace: namespace.clone(),
                    capabilities,
                },
            );
            Ok(Arc::new(adapter))
        }
    }
}
