// ABOUTME: Builds the cluster objects for one descriptor as JSON manifests.
// ABOUTME: Deployment always; Service, IngressRoute, HPA, PDB and NetworkPolicy when declared.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use super::ResourceKind;
use crate::descriptor::{
    DeploymentDescriptor, HpaBehavior, IntOrPercent, NetworkPolicyConfig, NetworkPolicyPeer,
    NetworkPolicyRule, PolicyPort, PortRef, ProbeCheck, ProbeConfig, ResourceSet, RolloutStrategy,
    ScalingRules, label_constraint,
};
use crate::orchestrator::MANAGED_LABEL;

fn metadata(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": labels,
    })
}

fn header(kind: ResourceKind, metadata: Value) -> Map<String, Value> {
    let mut object = Map::new();
    object.insert("apiVersion".into(), kind.api_version().into());
    object.insert("kind".into(), kind.kind().into());
    object.insert("metadata".into(), metadata);
    object
}

/// Labels carried by every object owned by the workload.
pub fn owner_labels(descriptor: &DeploymentDescriptor) -> BTreeMap<String, String> {
    let mut labels = descriptor.selector_labels();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels
}

fn pod_labels(descriptor: &DeploymentDescriptor) -> BTreeMap<String, String> {
    let mut labels = descriptor.labels.clone();
    labels.extend(owner_labels(descriptor));
    labels
}

fn rollout_strategy(strategy: Option<&RolloutStrategy>) -> Value {
    let default_bound = IntOrPercent::Percent(25);
    match strategy {
        Some(RolloutStrategy::Recreate) => json!({"type": "Recreate"}),
        Some(RolloutStrategy::Rolling {
            max_surge,
            max_unavailable,
            ..
        }) => json!({
            "type": "RollingUpdate",
            "rollingUpdate": {
                "maxSurge": max_surge.to_json(),
                "maxUnavailable": max_unavailable.to_json(),
            }
        }),
        None => json!({
            "type": "RollingUpdate",
            "rollingUpdate": {
                "maxSurge": default_bound.to_json(),
                "maxUnavailable": default_bound.to_json(),
            }
        }),
    }
}

fn probe(config: &ProbeConfig) -> Value {
    let mut probe = match &config.check {
        ProbeCheck::Http { path, port, scheme } => json!({
            "httpGet": {
                "path": path,
                "port": port,
                "scheme": scheme.as_str().to_uppercase(),
            }
        }),
        ProbeCheck::Tcp { port } => json!({"tcpSocket": {"port": port}}),
        ProbeCheck::Exec(argv) => json!({"exec": {"command": argv.iter().collect::<Vec<_>>()}}),
    };
    probe["initialDelaySeconds"] = config.initial_delay.as_secs().into();
    probe["periodSeconds"] = config.period.as_secs().max(1).into();
    probe["timeoutSeconds"] = config.timeout.as_secs().max(1).into();
    probe["failureThreshold"] = config.failure_threshold.into();
    probe
}

fn resource_set(set: &ResourceSet) -> Value {
    let mut map = Map::new();
    if let Some(cpu) = &set.cpu {
        map.insert("cpu".into(), cpu.clone().into());
    }
    if let Some(memory) = &set.memory {
        map.insert("memory".into(), memory.clone().into());
    }
    Value::Object(map)
}

fn node_selector(descriptor: &DeploymentDescriptor) -> BTreeMap<String, String> {
    let mut selector: BTreeMap<String, String> = descriptor
        .placement
        .constraints
        .iter()
        .filter_map(|c| label_constraint(c))
        .map(|c| (c.key.to_string(), c.value.to_string()))
        .collect();
    if let Some(platform) = descriptor.placement.platforms.first() {
        if let Some(arch) = &platform.architecture {
            selector.insert("kubernetes.io/arch".into(), arch.clone());
        }
        if let Some(os) = &platform.os {
            selector.insert("kubernetes.io/os".into(), os.clone());
        }
    }
    selector
}

fn container(descriptor: &DeploymentDescriptor) -> Value {
    let mut container = json!({
        "name": descriptor.name.as_str(),
        "image": descriptor.image.to_string(),
    });

    if !descriptor.ports.is_empty() {
        container["ports"] = descriptor
            .ports
            .iter()
            .map(|p| {
                json!({
                    "containerPort": p.container_port,
                    "protocol": p.protocol.as_str().to_uppercase(),
                })
            })
            .collect();
    }
    if !descriptor.env.is_empty() {
        container["env"] = descriptor
            .env
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
    }
    if let Some(command) = &descriptor.command {
        container["command"] = json!(command);
    }
    if let Some(args) = &descriptor.args {
        container["args"] = json!(args);
    }
    if !descriptor.resources.is_empty() {
        let mut resources = Map::new();
        if !descriptor.resources.requests.is_empty() {
            resources.insert("requests".into(), resource_set(&descriptor.resources.requests));
        }
        if !descriptor.resources.limits.is_empty() {
            resources.insert("limits".into(), resource_set(&descriptor.resources.limits));
        }
        container["resources"] = Value::Object(resources);
    }
    if let Some(config) = &descriptor.probe {
        container["livenessProbe"] = probe(config);
        container["readinessProbe"] = probe(config);
    }
    if !descriptor.volumes.is_empty() {
        container["volumeMounts"] = descriptor
            .volumes
            .iter()
            .map(|v| {
                json!({
                    "name": v.name,
                    "mountPath": v.mount_path,
                    "readOnly": v.read_only,
                })
            })
            .collect();
    }
    container
}

pub fn deployment(descriptor: &DeploymentDescriptor, namespace: &str) -> Value {
    let replicas = match descriptor.active_autoscaling() {
        Some(hpa) => hpa.clamp(descriptor.replicas),
        None => descriptor.replicas,
    };

    let mut pod_spec = json!({"containers": [container(descriptor)]});
    if let Some(account) = &descriptor.service_account {
        pod_spec["serviceAccountName"] = account.clone().into();
    }
    let selector = node_selector(descriptor);
    if !selector.is_empty() {
        pod_spec["nodeSelector"] = json!(selector);
    }
    if !descriptor.volumes.is_empty() {
        pod_spec["volumes"] = descriptor
            .volumes
            .iter()
            .map(|v| match (&v.claim, &v.host_path) {
                (Some(claim), _) => json!({"name": v.name, "persistentVolumeClaim": {"claimName": claim}}),
                (None, Some(path)) => json!({"name": v.name, "hostPath": {"path": path}}),
                (None, None) => json!({"name": v.name, "emptyDir": {}}),
            })
            .collect();
    }

    let mut meta = metadata(descriptor.name.as_str(), namespace, &pod_labels(descriptor));
    if !descriptor.annotations.is_empty() {
        meta["annotations"] = json!(descriptor.annotations);
    }
    let mut object = header(ResourceKind::Deployment, meta);
    object.insert(
        "spec".into(),
        json!({
            "replicas": replicas,
            "selector": {"matchLabels": descriptor.selector_labels()},
            "strategy": rollout_strategy(descriptor.strategy.as_ref()),
            "template": {
                "metadata": {
                    "labels": pod_labels(descriptor),
                    "annotations": descriptor.annotations,
                },
                "spec": pod_spec,
            },
        }),
    );
    Value::Object(object)
}

pub fn service(descriptor: &DeploymentDescriptor, namespace: &str) -> Option<Value> {
    if descriptor.ports.is_empty() {
        return None;
    }
    let ports: Vec<Value> = descriptor
        .ports
        .iter()
        .map(|p| {
            json!({
                "name": format!("{}-{}", p.protocol.as_str(), p.container_port),
                "port": p.published_port.unwrap_or(p.container_port),
                "targetPort": p.container_port,
                "protocol": p.protocol.as_str().to_uppercase(),
            })
        })
        .collect();

    let mut object = header(
        ResourceKind::Service,
        metadata(descriptor.name.as_str(), namespace, &owner_labels(descriptor)),
    );
    object.insert(
        "spec".into(),
        json!({
            "type": "ClusterIP",
            "selector": descriptor.selector_labels(),
            "ports": ports,
        }),
    );
    Some(Value::Object(object))
}

pub fn ingress_route(descriptor: &DeploymentDescriptor, namespace: &str) -> Option<Value> {
    let domain = descriptor.domain.as_ref()?;
    let port = descriptor.ports.first().map_or(80, |p| p.container_port);

    let mut spec = json!({
        "entryPoints": ["web", "websecure"],
        "routes": [{
            "match": format!("Host(`{}`)", domain),
            "kind": "Rule",
            "services": [{"name": descriptor.name.as_str(), "port": port}],
        }],
    });
    if descriptor.ssl {
        spec["tls"] = json!({"certResolver": "letsencrypt"});
    }

    let mut object = header(
        ResourceKind::IngressRoute,
        metadata(
            &ResourceKind::IngressRoute.object_name(&descriptor.name),
            namespace,
            &owner_labels(descriptor),
        ),
    );
    object.insert("spec".into(), spec);
    Some(Value::Object(object))
}

fn scaling_rules(rules: &ScalingRules) -> Value {
    let mut value = json!({});
    if let Some(window) = rules.stabilization_window_secs {
        value["stabilizationWindowSeconds"] = window.into();
    }
    if !rules.policies.is_empty() {
        value["policies"] = rules
            .policies
            .iter()
            .map(|p| {
                json!({
                    "type": p.kind.as_str(),
                    "value": p.value,
                    "periodSeconds": p.period_secs,
                })
            })
            .collect();
    }
    value
}

fn hpa_behavior(behavior: Option<&HpaBehavior>) -> Value {
    let Some(behavior) = behavior else {
        return json!({
            "scaleDown": {
                "stabilizationWindowSeconds": 300,
                "policies": [{"type": "Percent", "value": 50, "periodSeconds": 60}],
            },
            "scaleUp": {
                "stabilizationWindowSeconds": 0,
                "policies": [{"type": "Percent", "value": 100, "periodSeconds": 15}],
            },
        });
    };
    let mut value = json!({});
    if let Some(up) = &behavior.scale_up {
        value["scaleUp"] = scaling_rules(up);
    }
    if let Some(down) = &behavior.scale_down {
        value["scaleDown"] = scaling_rules(down);
    }
    value
}

pub fn autoscaler(descriptor: &DeploymentDescriptor, namespace: &str) -> Option<Value> {
    let hpa = descriptor.active_autoscaling()?;

    let metrics: Vec<Value> = [("cpu", hpa.target_cpu), ("memory", hpa.target_memory)]
        .into_iter()
        .filter_map(|(resource, target)| {
            target.map(|utilization| {
                json!({
                    "type": "Resource",
                    "resource": {
                        "name": resource,
                        "target": {"type": "Utilization", "averageUtilization": utilization},
                    },
                })
            })
        })
        .collect();

    let mut object = header(
        ResourceKind::Autoscaler,
        metadata(
            &ResourceKind::Autoscaler.object_name(&descriptor.name),
            namespace,
            &owner_labels(descriptor),
        ),
    );
    object.insert(
        "spec".into(),
        json!({
            "scaleTargetRef": {
                "apiVersion": ResourceKind::Deployment.api_version(),
                "kind": ResourceKind::Deployment.kind(),
                "name": hpa.target_name.as_deref().unwrap_or(descriptor.name.as_str()),
            },
            "minReplicas": hpa.min_replicas,
            "maxReplicas": hpa.max_replicas,
            "metrics": metrics,
            "behavior": hpa_behavior(hpa.behavior.as_ref()),
        }),
    );
    Some(Value::Object(object))
}

pub fn disruption_budget(descriptor: &DeploymentDescriptor, namespace: &str) -> Option<Value> {
    let pdb = descriptor.pdb.as_ref()?;
    let mut spec = json!({"selector": {"matchLabels": descriptor.selector_labels()}});
    if let Some(min) = pdb.min_available {
        spec["minAvailable"] = min.into();
    } else if let Some(max) = pdb.max_unavailable {
        spec["maxUnavailable"] = max.into();
    }

    let mut object = header(
        ResourceKind::DisruptionBudget,
        metadata(
            &ResourceKind::DisruptionBudget.object_name(&descriptor.name),
            namespace,
            &owner_labels(descriptor),
        ),
    );
    object.insert("spec".into(), spec);
    Some(Value::Object(object))
}

fn peer(peer: &NetworkPolicyPeer) -> Value {
    let mut value = json!({});
    if let Some(labels) = &peer.pod_selector {
        value["podSelector"] = json!({"matchLabels": labels});
    }
    if let Some(labels) = &peer.namespace_selector {
        value["namespaceSelector"] = json!({"matchLabels": labels});
    }
    if let Some(block) = &peer.ip_block {
        value["ipBlock"] = json!({"cidr": block.cidr});
        if !block.except.is_empty() {
            value["ipBlock"]["except"] = json!(block.except);
        }
    }
    value
}

fn policy_port(port: &PolicyPort) -> Value {
    let mut value = json!({});
    if let Some(protocol) = port.protocol {
        value["protocol"] = protocol.as_str().to_uppercase().into();
    }
    match &port.port {
        Some(PortRef::Number(n)) => value["port"] = (*n).into(),
        Some(PortRef::Name(name)) => value["port"] = name.clone().into(),
        None => {}
    }
    value
}

fn policy_rules(rules: &[NetworkPolicyRule], peers_key: &str) -> Value {
    rules
        .iter()
        .map(|rule| {
            let mut value = json!({});
            if !rule.peers.is_empty() {
                value[peers_key] = rule.peers.iter().map(peer).collect();
            }
            if !rule.ports.is_empty() {
                value["ports"] = rule.ports.iter().map(policy_port).collect();
            }
            value
        })
        .collect()
}

/// Namespace the network policy lives in.
pub fn policy_namespace<'a>(policy: &'a NetworkPolicyConfig, namespace: &'a str) -> &'a str {
    policy.namespace.as_deref().unwrap_or(namespace)
}

pub fn network_policy(descriptor: &DeploymentDescriptor, namespace: &str) -> Option<Value> {
    let policy = descriptor.network_policy.as_ref()?;
    let mut spec = json!({
        "podSelector": {"matchLabels": policy.pod_selector},
        "policyTypes": policy.policy_types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
    });
    if !policy.ingress.is_empty() {
        spec["ingress"] = policy_rules(&policy.ingress, "from");
    }
    if !policy.egress.is_empty() {
        spec["egress"] = policy_rules(&policy.egress, "to");
    }

    let mut object = header(
        ResourceKind::NetworkPolicy,
        metadata(
            &policy.name,
            policy_namespace(policy, namespace),
            &owner_labels(descriptor),
        ),
    );
    object.insert("spec".into(), spec);
    Some(Value::Object(object))
}
