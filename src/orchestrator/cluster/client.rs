// ABOUTME: ClusterApi over the Kubernetes API using kube dynamic objects.
// ABOUTME: Client configuration comes from an explicit kubeconfig, a context, or the environment.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use std::path::Path;

use super::{ClusterApi, ClusterInfo, ResourceKind};
use crate::orchestrator::{
    AdapterError, ApplySnafu, ConnectionSnafu, DescribeSnafu, OrchestratorKind, RemoveSnafu,
};

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}

fn connection_error(e: impl std::fmt::Display) -> AdapterError {
    ConnectionSnafu {
        platform: OrchestratorKind::Cluster,
        message: e.to_string(),
    }
    .build()
}

fn resource_label(kind: ResourceKind, namespace: &str, name: &str) -> String {
    format!("{} {}/{}", kind.kind(), namespace, name)
}

pub struct KubeCluster {
    client: Client,
    endpoint: String,
}

impl KubeCluster {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Build a client from `kubeconfig` when given, otherwise from the usual
    /// in-cluster or `~/.kube/config` lookup. `context` selects a kubeconfig context.
    pub async fn connect(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let options = KubeConfigOptions {
            context: context.map(String::from),
            ..Default::default()
        };
        let config = match (kubeconfig, context) {
            (Some(path), _) => {
                let file = Kubeconfig::read_from(path).map_err(connection_error)?;
                Config::from_custom_kubeconfig(file, &options)
                    .await
                    .map_err(connection_error)?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options)
                .await
                .map_err(connection_error)?,
            (None, None) => Config::infer().await.map_err(connection_error)?,
        };
        let endpoint = config.cluster_url.to_string();
        tracing::debug!("Connecting to cluster at {}", endpoint);
        let client = Client::try_from(config).map_err(connection_error)?;
        Ok(Self::new(client, endpoint))
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    fn object(kind: ResourceKind, manifest: &Value) -> Result<DynamicObject, AdapterError> {
        serde_json::from_value(manifest.clone()).map_err(|e| {
            ApplySnafu {
                resource: kind.kind().to_string(),
                message: format!("invalid manifest: {}", e),
            }
            .build()
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn cluster_info(&self) -> Result<ClusterInfo, AdapterError> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(connection_error)?;
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(connection_error)?;

        let ready = nodes
            .items
            .iter()
            .filter(|node| {
                node.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
            })
            .count();

        Ok(ClusterInfo {
            version: Some(version.git_version),
            ready_nodes: u32::try_from(ready).unwrap_or(u32::MAX),
            total_nodes: u32::try_from(nodes.items.len()).unwrap_or(u32::MAX),
            endpoint: Some(self.endpoint.clone()),
        })
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AdapterError> {
        let api = Api::<Namespace>::all(self.client.clone());
        let apply_error = |e: kube::Error| {
            ApplySnafu {
                resource: format!("namespace {}", namespace),
                message: e.to_string(),
            }
            .build()
        };
        if api.get_opt(namespace).await.map_err(apply_error)?.is_some() {
            return Ok(());
        }

        tracing::info!("Creating namespace {}", namespace);
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            // Lost a race with another creator.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(e) => Err(apply_error(e)),
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, AdapterError> {
        let describe_error = |message: String| {
            DescribeSnafu {
                resource: resource_label(kind, namespace, name),
                message,
            }
            .build()
        };
        let object = self
            .api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| describe_error(e.to_string()))?;
        object
            .map(|o| serde_json::to_value(o).map_err(|e| describe_error(e.to_string())))
            .transpose()
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<(), AdapterError> {
        let object = Self::object(kind, manifest)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        self.api(kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| {
                ApplySnafu {
                    resource: resource_label(kind, namespace, &name),
                    message: e.to_string(),
                }
                .build()
            })?;
        Ok(())
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        manifest: &Value,
    ) -> Result<(), AdapterError> {
        let object = Self::object(kind, manifest)?;
        self.api(kind, namespace)
            .replace(name, &PostParams::default(), &object)
            .await
            .map_err(|e| {
                ApplySnafu {
                    resource: resource_label(kind, namespace, name),
                    message: e.to_string(),
                }
                .build()
            })?;
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, AdapterError> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RemoveSnafu {
                resource: resource_label(kind, namespace, name),
                message: e.to_string(),
            }
            .build()),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, AdapterError> {
        let describe_error = |message: String| {
            DescribeSnafu {
                resource: format!("{} in {}", kind.plural(), namespace),
                message,
            }
            .build()
        };
        let objects = self
            .api(kind, namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| describe_error(e.to_string()))?;
        objects
            .items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(|e| describe_error(e.to_string())))
            .collect()
    }
}
