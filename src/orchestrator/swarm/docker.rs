// ABOUTME: SwarmApi over the Docker Engine API using bollard.
// ABOUTME: Connects to a local socket or to a remote engine through an SSH-forwarded socket.

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{
    InspectNetworkOptions, InspectServiceOptions, ListTasksOptions, UpdateServiceOptionsBuilder,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::spec::ServiceSpec;
use super::{ServiceState, SwarmApi, SwarmInfo};
use crate::orchestrator::{
    AdapterError, ApplySnafu, ConnectionSnafu, DescribeSnafu, MANAGED_LABEL, OrchestratorKind,
    RemoveSnafu,
};
use crate::ssh::Session;

pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn connection_error(e: impl std::fmt::Display) -> AdapterError {
    ConnectionSnafu {
        platform: OrchestratorKind::Swarm,
        message: e.to_string(),
    }
    .build()
}

pub struct DockerSwarm {
    client: Docker,
    // Keeps the forwarded socket alive for remote engines.
    _session: Option<Arc<Session>>,
}

impl DockerSwarm {
    pub fn new(client: Docker) -> Self {
        Self {
            client,
            _session: None,
        }
    }

    pub fn connect_local(socket: &str) -> Result<Self, AdapterError> {
        let client = Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(connection_error)?;
        Ok(Self::new(client))
    }

    /// Reach the engine on the far side of `session`.
    pub async fn connect_via_session(
        session: Arc<Session>,
        remote_socket: &str,
    ) -> Result<Self, AdapterError> {
        let local_socket = session
            .forward_socket(remote_socket)
            .await
            .map_err(connection_error)?;
        tracing::debug!("Forwarded {} to {}", remote_socket, local_socket);
        let client = Docker::connect_with_unix(&local_socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(connection_error)?;
        Ok(Self {
            client,
            _session: Some(session),
        })
    }

    fn engine_spec(spec: &ServiceSpec) -> Result<bollard::models::ServiceSpec, AdapterError> {
        serde_json::to_value(spec)
            .and_then(serde_json::from_value)
            .map_err(|e| {
                ApplySnafu {
                    resource: format!("service {}", spec.name),
                    message: format!("spec conversion failed: {}", e),
                }
                .build()
            })
    }
}

#[async_trait]
impl SwarmApi for DockerSwarm {
    async fn info(&self) -> Result<SwarmInfo, AdapterError> {
        let info = self.client.info().await.map_err(connection_error)?;
        let value = serde_json::to_value(&info).map_err(connection_error)?;
        let swarm = &value["Swarm"];
        Ok(SwarmInfo {
            local_node_state: swarm["LocalNodeState"]
                .as_str()
                .unwrap_or("inactive")
                .to_string(),
            nodes: swarm["Nodes"].as_u64().and_then(|n| u32::try_from(n).ok()),
            version: info.server_version,
        })
    }

    async fn ensure_network(&self, name: &str) -> Result<(), AdapterError> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(connection_error(e)),
        }

        tracing::info!("Creating overlay network {}", name);
        let request = bollard::models::NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("overlay".to_string()),
            attachable: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };
        self.client.create_network(request).await.map_err(|e| {
            ApplySnafu {
                resource: format!("network {}", name),
                message: e.to_string(),
            }
            .build()
        })?;
        Ok(())
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceState>, AdapterError> {
        let describe_error = |message: String| {
            DescribeSnafu {
                resource: format!("service {}", name),
                message,
            }
            .build()
        };

        let service = match self
            .client
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => service,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(describe_error(e.to_string())),
        };

        let value = serde_json::to_value(&service).map_err(|e| describe_error(e.to_string()))?;
        let spec: ServiceSpec = serde_json::from_value(value["Spec"].clone())
            .map_err(|e| describe_error(format!("unexpected spec: {}", e)))?;
        Ok(Some(ServiceState {
            version: value["Version"]["Index"].as_u64().unwrap_or(0),
            spec,
            update_state: value["UpdateStatus"]["State"].as_str().map(String::from),
        }))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), AdapterError> {
        let engine_spec = Self::engine_spec(spec)?;
        self.client
            .create_service(engine_spec, None)
            .await
            .map_err(|e| {
                ApplySnafu {
                    resource: format!("service {}", spec.name),
                    message: e.to_string(),
                }
                .build()
            })?;
        Ok(())
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), AdapterError> {
        let engine_spec = Self::engine_spec(spec)?;
        let options = UpdateServiceOptionsBuilder::default()
            .version(i32::try_from(version).unwrap_or(i32::MAX))
            .build();
        self.client
            .update_service(name, engine_spec, options, None)
            .await
            .map_err(|e| {
                ApplySnafu {
                    resource: format!("service {}", name),
                    message: e.to_string(),
                }
                .build()
            })?;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<bool, AdapterError> {
        match self.client.delete_service(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RemoveSnafu {
                resource: format!("service {}", name),
                message: e.to_string(),
            }
            .build()),
        }
    }

    async fn running_tasks(&self, name: &str, generation: u64) -> Result<u32, AdapterError> {
        let filters = HashMap::from([
            ("service".to_string(), vec![name.to_string()]),
            ("desired-state".to_string(), vec!["running".to_string()]),
        ]);
        let tasks = self
            .client
            .list_tasks(Some(ListTasksOptions {
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| {
                DescribeSnafu {
                    resource: format!("tasks of {}", name),
                    message: e.to_string(),
                }
                .build()
            })?;

        let running = tasks
            .iter()
            .filter_map(|task| serde_json::to_value(task).ok())
            .filter(|task: &Value| task["Status"]["State"] == "running")
            .filter(|task| task["Spec"]["ForceUpdate"].as_u64().unwrap_or(0) == generation)
            .count();
        Ok(u32::try_from(running).unwrap_or(u32::MAX))
    }
}
