// ABOUTME: Translates a deployment descriptor into a swarm service spec.
// ABOUTME: Pure; quantity parsing errors surface before any engine call.

use std::collections::BTreeMap;
use std::time::Duration;

use super::spec::{
    ContainerSpec, EndpointPort, EndpointSpec, HealthCheck, Mount, NetworkAttachment,
    PlacementPreference, Replicated, ResourceObject, RestartPolicy, ServiceMode, ServiceSpec,
    Spread, SwarmPlacement, SwarmPlatform, TaskResources, TaskSpec, UpdatePolicy,
};
use crate::descriptor::{
    DeploymentDescriptor, ProbeCheck, ProbeConfig, PublishMode, ResourceSet, RolloutStrategy,
    WorkloadMode,
};
use crate::orchestrator::{AdapterError, MANAGED_LABEL, parse_cpu, parse_memory};

const UPDATE_DELAY: Duration = Duration::from_secs(10);
const RESTART_ATTEMPTS: u64 = 3;

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

pub fn service_spec(
    descriptor: &DeploymentDescriptor,
    network: &str,
) -> Result<ServiceSpec, AdapterError> {
    let mut container_labels = descriptor.labels.clone();
    container_labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    let mut service_labels = container_labels.clone();
    service_labels.extend(descriptor.annotations.clone());
    service_labels.extend(routing_labels(descriptor, network));

    Ok(ServiceSpec {
        name: descriptor.name.to_string(),
        labels: service_labels,
        task_template: TaskSpec {
            container_spec: ContainerSpec {
                image: descriptor.image.to_string(),
                labels: container_labels,
                command: descriptor.command.clone(),
                args: descriptor.args.clone(),
                env: descriptor
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
                mounts: mounts(descriptor),
                health_check: descriptor.probe.as_ref().map(health_check),
            },
            resources: resources(descriptor)?,
            restart_policy: Some(RestartPolicy {
                condition: "on-failure".to_string(),
                max_attempts: RESTART_ATTEMPTS,
            }),
            placement: placement(descriptor),
            networks: vec![NetworkAttachment {
                target: network.to_string(),
            }],
            force_update: 0,
        },
        mode: match descriptor.mode {
            WorkloadMode::Replicated => ServiceMode {
                replicated: Some(Replicated {
                    replicas: u64::from(descriptor.replicas),
                }),
                global: None,
            },
            WorkloadMode::Global => ServiceMode {
                replicated: None,
                global: Some(BTreeMap::new()),
            },
        },
        update_config: Some(update_policy(descriptor, "rollback")),
        rollback_config: Some(update_policy(descriptor, "pause")),
        endpoint_spec: endpoint(descriptor),
    })
}

fn mounts(descriptor: &DeploymentDescriptor) -> Vec<Mount> {
    descriptor
        .volumes
        .iter()
        .map(|volume| match &volume.host_path {
            Some(host) => Mount {
                kind: "bind".to_string(),
                source: host.clone(),
                target: volume.mount_path.clone(),
                read_only: volume.read_only,
            },
            None => Mount {
                kind: "volume".to_string(),
                source: volume.claim.clone().unwrap_or_else(|| volume.name.clone()),
                target: volume.mount_path.clone(),
                read_only: volume.read_only,
            },
        })
        .collect()
}

fn health_check(probe: &ProbeConfig) -> HealthCheck {
    let test = match &probe.check {
        ProbeCheck::Http { path, port, scheme } => vec![
            "CMD-SHELL".to_string(),
            format!(
                "curl -f {}://localhost:{}{} || exit 1",
                scheme.as_str(),
                port,
                path
            ),
        ],
        ProbeCheck::Tcp { port } => vec![
            "CMD-SHELL".to_string(),
            format!("nc -z localhost {} || exit 1", port),
        ],
        ProbeCheck::Exec(argv) => std::iter::once("CMD".to_string())
            .chain(argv.iter().cloned())
            .collect(),
    };
    HealthCheck {
        test,
        interval: nanos(probe.period),
        timeout: nanos(probe.timeout),
        retries: i64::from(probe.failure_threshold),
        start_period: nanos(probe.initial_delay),
    }
}

fn resource_object(set: &ResourceSet) -> Result<Option<ResourceObject>, AdapterError> {
    let object = ResourceObject {
        nano_cpus: set.cpu.as_deref().map(parse_cpu).transpose()?,
        memory_bytes: set.memory.as_deref().map(parse_memory).transpose()?,
    };
    Ok((!object.is_empty()).then_some(object))
}

fn resources(descriptor: &DeploymentDescriptor) -> Result<Option<TaskResources>, AdapterError> {
    let limits = resource_object(&descriptor.resources.limits)?;
    let reservations = resource_object(&descriptor.resources.requests)?;
    if limits.is_none() && reservations.is_none() {
        return Ok(None);
    }
    Ok(Some(TaskResources {
        limits,
        reservations,
    }))
}

fn placement(descriptor: &DeploymentDescriptor) -> Option<SwarmPlacement> {
    let placement = &descriptor.placement;
    if placement.is_empty() {
        return None;
    }
    Some(SwarmPlacement {
        constraints: placement.constraints.clone(),
        preferences: placement
            .preferences
            .iter()
            .map(|p| PlacementPreference {
                spread: Spread {
                    spread_descriptor: p.clone(),
                },
            })
            .collect(),
        platforms: placement
            .platforms
            .iter()
            .map(|p| SwarmPlatform {
                architecture: p.architecture.clone(),
                os: p.os.clone(),
            })
            .collect(),
        max_replicas: placement.max_replicas_per_node,
    })
}

/// Update and rollback share a shape; only the failure action differs.
fn update_policy(descriptor: &DeploymentDescriptor, failure_action: &str) -> UpdatePolicy {
    let strategy = descriptor.strategy.clone().unwrap_or_default();
    let (parallelism, monitor, order) = match strategy {
        RolloutStrategy::Rolling {
            max_surge, monitor, ..
        } => (
            u64::from(max_surge.resolve(descriptor.replicas).max(1)),
            monitor,
            "start-first",
        ),
        // Zero parallelism replaces every task at once.
        RolloutStrategy::Recreate => (0, Duration::from_secs(5), "stop-first"),
    };
    UpdatePolicy {
        parallelism,
        delay: nanos(UPDATE_DELAY),
        failure_action: failure_action.to_string(),
        monitor: nanos(monitor),
        order: order.to_string(),
    }
}

fn endpoint(descriptor: &DeploymentDescriptor) -> Option<EndpointSpec> {
    if descriptor.ports.is_empty() {
        return None;
    }
    let ports = descriptor
        .ports
        .iter()
        .map(|port| EndpointPort {
            protocol: port.protocol.as_str().to_string(),
            target_port: port.container_port,
            published_port: port.published_port,
            publish_mode: match port.publish_mode {
                PublishMode::Ingress => "ingress",
                PublishMode::Host => "host",
            }
            .to_string(),
        })
        .collect();
    Some(EndpointSpec { ports })
}

/// Traefik docker-provider labels routing `domain` to the first port.
fn routing_labels(descriptor: &DeploymentDescriptor, network: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let Some(domain) = &descriptor.domain else {
        return labels;
    };
    let router = format!("traefik.http.routers.{}", descriptor.name);
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert("traefik.docker.network".to_string(), network.to_string());
    labels.insert(format!("{}.rule", router), format!("Host(`{}`)", domain));
    if descriptor.ssl {
        labels.insert(format!("{}.entrypoints", router), "websecure".to_string());
        labels.insert(format!("{}.tls.certresolver", router), "letsencrypt".to_string());
    } else {
        labels.insert(format!("{}.entrypoints", router), "web".to_string());
    }
    if let Some(port) = descriptor.ports.first() {
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", descriptor.name),
            port.container_port.to_string(),
        );
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{IntOrPercent, Port, ProbeConfig, ResourceRequirements, Volume};
    use crate::orchestrator::AdapterErrorKind;
    use crate::types::{ImageRef, ServiceName};
    use nonempty::nonempty;

    fn web() -> crate::descriptor::DescriptorBuilder {
        DeploymentDescriptor::builder(
            ServiceName::new("web").unwrap(),
            ImageRef::parse("nginx:latest").unwrap(),
        )
    }

    #[test]
    fn minimal_spec_has_defaults() {
        let spec = service_spec(&web().replicas(2).build().unwrap(), "rollout-network").unwrap();

        assert_eq!(spec.name, "web");
        assert_eq!(spec.replicas(), Some(2));
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(spec.task_template.networks[0].target, "rollout-network");
        let restart = spec.task_template.restart_policy.unwrap();
        assert_eq!(restart.condition, "on-failure");
        assert_eq!(restart.max_attempts, 3);

        let update = spec.update_config.unwrap();
        assert_eq!(update.failure_action, "rollback");
        assert_eq!(update.order, "start-first");
        assert_eq!(update.delay, 10_000_000_000);
        assert_eq!(spec.rollback_config.unwrap().failure_action, "pause");
    }

    #[test]
    fn zero_replicas_stay_replicated() {
        let spec = service_spec(&web().replicas(0).build().unwrap(), "net").unwrap();
        assert_eq!(spec.replicas(), Some(0));
        assert!(spec.mode.global.is_none());
    }

    #[test]
    fn global_mode_has_no_replica_count() {
        let spec = service_spec(&web().mode(WorkloadMode::Global).build().unwrap(), "net").unwrap();
        assert_eq!(spec.replicas(), None);
        assert_eq!(spec.mode.global, Some(BTreeMap::new()));
    }

    #[test]
    fn probes_become_healthchecks() {
        let mut probe = ProbeConfig::http("/health", 8080);
        probe.initial_delay = Duration::from_secs(5);
        let spec = service_spec(&web().probe(probe).build().unwrap(), "net").unwrap();
        let check = spec.task_template.container_spec.health_check.unwrap();
        assert_eq!(
            check.test,
            vec!["CMD-SHELL", "curl -f http://localhost:8080/health || exit 1"]
        );
        assert_eq!(check.interval, 10_000_000_000);
        assert_eq!(check.timeout, 5_000_000_000);
        assert_eq!(check.retries, 3);
        assert_eq!(check.start_period, 5_000_000_000);

        let exec = ProbeConfig::new(ProbeCheck::Exec(nonempty!["pg_isready".to_string()]));
        let spec = service_spec(&web().probe(exec).build().unwrap(), "net").unwrap();
        let check = spec.task_template.container_spec.health_check.unwrap();
        assert_eq!(check.test, vec!["CMD", "pg_isready"]);

        let tcp = ProbeConfig::new(ProbeCheck::Tcp { port: 5432 });
        let spec = service_spec(&web().probe(tcp).build().unwrap(), "net").unwrap();
        let check = spec.task_template.container_spec.health_check.unwrap();
        assert_eq!(check.test[1], "nc -z localhost 5432 || exit 1");
    }

    #[test]
    fn volumes_become_mounts() {
        let descriptor = web()
            .volume(Volume {
                name: "data".into(),
                mount_path: "/data".into(),
                claim: Some("pgdata".into()),
                host_path: None,
                read_only: false,
            })
            .volume(Volume {
                name: "sock".into(),
                mount_path: "/var/run/docker.sock".into(),
                claim: None,
                host_path: Some("/var/run/docker.sock".into()),
                read_only: true,
            })
            .build()
            .unwrap();
        let mounts = service_spec(&descriptor, "net").unwrap().task_template.container_spec.mounts;
        assert_eq!(mounts[0].kind, "volume");
        assert_eq!(mounts[0].source, "pgdata");
        assert_eq!(mounts[1].kind, "bind");
        assert!(mounts[1].read_only);
    }

    #[test]
    fn resources_are_parsed_into_engine_units() {
        let mut resources = ResourceRequirements::default();
        resources.limits.cpu = Some("500m".into());
        resources.limits.memory = Some("256Mi".into());
        let spec = service_spec(&web().resources(resources).build().unwrap(), "net").unwrap();
        let limits = spec.task_template.resources.unwrap().limits.unwrap();
        assert_eq!(limits.nano_cpus, Some(500_000_000));
        assert_eq!(limits.memory_bytes, Some(256 * 1024 * 1024));
    }

    #[test]
    fn bad_quantities_fail_translation() {
        let mut resources = ResourceRequirements::default();
        resources.requests.memory = Some("plenty".into());
        let err = service_spec(&web().resources(resources).build().unwrap(), "net").unwrap_err();
        assert_eq!(err.kind(), AdapterErrorKind::Quantity);
    }

    #[test]
    fn surge_sets_parallelism() {
        let descriptor = web()
            .replicas(8)
            .strategy(RolloutStrategy::Rolling {
                max_surge: IntOrPercent::Percent(25),
                max_unavailable: IntOrPercent::Int(0),
                monitor: Duration::from_secs(30),
            })
            .build()
            .unwrap();
        let update = service_spec(&descriptor, "net").unwrap().update_config.unwrap();
        assert_eq!(update.parallelism, 2);
        assert_eq!(update.monitor, 30_000_000_000);

        let recreate = web().strategy(RolloutStrategy::Recreate).build().unwrap();
        let update = service_spec(&recreate, "net").unwrap().update_config.unwrap();
        assert_eq!(update.parallelism, 0);
        assert_eq!(update.order, "stop-first");
    }

    #[test]
    fn domains_become_traefik_labels() {
        let descriptor = web()
            .port(Port::tcp(3000))
            .domain("app.example.com", true)
            .build()
            .unwrap();
        let spec = service_spec(&descriptor, "rollout-network").unwrap();
        let label = |k: &str| spec.labels.get(k).map(String::as_str);
        assert_eq!(label("traefik.enable"), Some("true"));
        assert_eq!(
            label("traefik.http.routers.web.rule"),
            Some("Host(`app.example.com`)")
        );
        assert_eq!(label("traefik.http.routers.web.tls.certresolver"), Some("letsencrypt"));
        assert_eq!(
            label("traefik.http.services.web.loadbalancer.server.port"),
            Some("3000")
        );
        let ports = spec.endpoint_spec.unwrap().ports;
        assert_eq!(ports[0].target_port, 3000);
        assert_eq!(ports[0].publish_mode, "ingress");
    }
}
