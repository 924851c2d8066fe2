// ABOUTME: Test support utilities.
// ABOUTME: In-memory swarm and cluster, a scripted transport, recording store and notifier.

use async_trait::async_trait;
use parking_lot::Mutex;
use rollout::cancel::CancelToken;
use rollout::descriptor::DeploymentDescriptor;
use rollout::executor::{ExecError, LogChannel, LogReceiver, RemoteExecutor, Transport};
use rollout::notify::{Notifier, NotifyError, RunNotification};
use rollout::orchestrator::cluster::{ClusterApi, ClusterInfo, ResourceKind};
use rollout::orchestrator::swarm::spec::ServiceSpec;
use rollout::orchestrator::swarm::{ServiceState, SwarmApi, SwarmInfo};
use rollout::orchestrator::{AdapterError, ApplySnafu, ConnectionSnafu, OrchestratorKind};
use rollout::pipeline::{DeploymentPipeline, PipelineSettings};
use rollout::status::{
    DeploymentStatus, FileStatusStore, MemoryStatusStore, ServiceRecord, StatusError, StatusStore,
    StatusTracker,
};
use rollout::types::{ImageRef, ServiceName};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("rollout=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[allow(dead_code)]
pub fn service(name: &str) -> ServiceName {
    ServiceName::new(name).unwrap()
}

#[allow(dead_code)]
pub fn descriptor(name: &str, image: &str) -> DeploymentDescriptor {
    DeploymentDescriptor::builder(service(name), ImageRef::parse(image).unwrap())
        .replicas(2)
        .build()
        .unwrap()
}

/// Pipeline settings with polling fast enough for tests.
#[allow(dead_code)]
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        work_dir: "/srv/rollout".to_string(),
        health_grace: Duration::ZERO,
        health_timeout: Duration::from_millis(300),
        health_poll_interval: Duration::from_millis(10),
        ..PipelineSettings::default()
    }
}

/// Everything a pipeline test inspects after a run.
#[allow(dead_code)]
pub struct Harness {
    pub pipeline: Arc<DeploymentPipeline>,
    pub transport: Arc<ScriptedTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<RecordingStore>,
    pub logs: LogReceiver,
}

#[allow(dead_code)]
pub fn harness(adapter: Arc<dyn rollout::orchestrator::OrchestratorAdapter>, settings: PipelineSettings) -> Harness {
    build_harness(adapter, settings, RecordingStore::default())
}

/// Harness whose records and service locks live in `state_dir`, as the CLI's do.
///
/// Two harnesses over the same directory behave like two rollout processes.
#[allow(dead_code)]
pub fn harness_in(
    adapter: Arc<dyn rollout::orchestrator::OrchestratorAdapter>,
    settings: PipelineSettings,
    state_dir: &Path,
) -> Harness {
    let store = RecordingStore::over(Arc::new(FileStatusStore::new(state_dir)));
    build_harness(adapter, settings, store)
}

fn build_harness(
    adapter: Arc<dyn rollout::orchestrator::OrchestratorAdapter>,
    settings: PipelineSettings,
    store: RecordingStore,
) -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let store = Arc::new(store);
    let (channel, logs) = LogChannel::bounded(1024);
    let executor = RemoteExecutor::new(Arc::new(channel))
        .with_settings(rollout::executor::ExecSettings {
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        })
        .with_local(transport.clone());
    let pipeline = DeploymentPipeline::new(
        adapter,
        Arc::new(executor),
        StatusTracker::new(store.clone()),
        settings,
    )
    .with_notifier(notifier.clone());
    Harness {
        pipeline: Arc::new(pipeline),
        transport,
        notifier,
        store,
        logs,
    }
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

struct Rule {
    needle: String,
    output: Vec<String>,
    exit_code: i32,
}

/// Transport that answers scripts by substring instead of running them.
///
/// Scripts with no matching rule succeed silently.
#[derive(Default)]
pub struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    hang_on: Mutex<Option<String>>,
    scripts: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, Vec<u8>>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts containing `needle` print `output` and exit with `exit_code`.
    pub fn respond(&self, needle: &str, output: &[&str], exit_code: i32) {
        self.rules.lock().push(Rule {
            needle: needle.to_string(),
            output: output.iter().map(|s| s.to_string()).collect(),
            exit_code,
        });
    }

    /// Scripts containing `needle` run until cancelled.
    pub fn hang_on(&self, needle: &str) {
        *self.hang_on.lock() = Some(needle.to_string());
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }

    pub fn log(&self, path: &str) -> String {
        self.logs
            .lock()
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn prepare_log(&self, path: &str) -> Result<u64, ExecError> {
        let mut logs = self.logs.lock();
        Ok(logs.entry(path.to_string()).or_default().len() as u64)
    }

    async fn run(&self, script: &str, log_path: &str, cancel: &CancelToken) -> Result<i32, ExecError> {
        self.scripts.lock().push(script.to_string());

        let hangs = self
            .hang_on
            .lock()
            .as_ref()
            .is_some_and(|needle| script.contains(needle.as_str()));
        if hangs {
            cancel.cancelled().await;
            return Err(ExecError::Cancelled);
        }

        let (output, exit_code) = {
            let rules = self.rules.lock();
            match rules.iter().find(|r| script.contains(r.needle.as_str())) {
                Some(rule) => (rule.output.clone(), rule.exit_code),
                None => (Vec::new(), 0),
            }
        };
        let mut logs = self.logs.lock();
        let log = logs.entry(log_path.to_string()).or_default();
        for line in output {
            log.extend_from_slice(line.as_bytes());
            log.push(b'\n');
        }
        Ok(exit_code)
    }

    async fn read_log(&self, path: &str, offset: u64) -> Result<Vec<u8>, ExecError> {
        let logs = self.logs.lock();
        let bytes = logs.get(path).map(Vec::as_slice).unwrap_or_default();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        Ok(bytes[start..].to_vec())
    }
}

// ---------------------------------------------------------------------------
// Recording status store
// ---------------------------------------------------------------------------

/// Store that remembers every status it was asked to save.
pub struct RecordingStore {
    inner: Arc<dyn StatusStore>,
    history: Mutex<Vec<(ServiceName, DeploymentStatus)>>,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::over(Arc::new(MemoryStatusStore::new()))
    }
}

#[allow(dead_code)]
impl RecordingStore {
    pub fn over(inner: Arc<dyn StatusStore>) -> Self {
        Self {
            inner,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Saved statuses for `service`, oldest first, with repeats collapsed.
    pub fn statuses(&self, service: &str) -> Vec<DeploymentStatus> {
        let mut seen: Vec<DeploymentStatus> = Vec::new();
        for (name, status) in self.history.lock().iter() {
            if name.as_str() == service && seen.last() != Some(status) {
                seen.push(*status);
            }
        }
        seen
    }
}

#[async_trait]
impl StatusStore for RecordingStore {
    async fn load(&self, service: &ServiceName) -> Result<Option<ServiceRecord>, StatusError> {
        self.inner.load(service).await
    }

    async fn save(&self, record: &ServiceRecord) -> Result<(), StatusError> {
        self.history
            .lock()
            .push((record.service.clone(), record.status));
        self.inner.save(record).await
    }

    async fn delete(&self, service: &ServiceName) -> Result<(), StatusError> {
        self.inner.delete(service).await
    }

    fn lock_dir(&self) -> Option<&Path> {
        self.inner.lock_dir()
    }
}

// ---------------------------------------------------------------------------
// Recording notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<RunNotification>>,
    fail: Mutex<bool>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<RunNotification> {
        self.seen.lock().clone()
    }

    /// Make every later delivery fail after recording it.
    pub fn fail_deliveries(&self) {
        *self.fail.lock() = true;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &RunNotification) -> Result<(), NotifyError> {
        self.seen.lock().push(notification.clone());
        if *self.fail.lock() {
            return Err(NotifyError::HookFailed {
                hook: "on-failure",
                code: Some(1),
                stderr: "webhook unreachable".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory swarm
// ---------------------------------------------------------------------------

/// Tasks the fake engine runs for one service.
#[derive(Debug, Clone, Copy)]
struct Tasks {
    /// `ForceUpdate` of the template they were created from.
    generation: u64,
    running: u32,
}

#[derive(Default)]
struct SwarmState {
    services: HashMap<String, ServiceState>,
    tasks: HashMap<String, Tasks>,
    networks: BTreeSet<String>,
    /// Services running one of these images never get a running task.
    broken_images: BTreeSet<String>,
    /// Updates to one of these images are reverted by the engine.
    reverted_images: BTreeSet<String>,
    /// Updates are stored but never scheduled.
    stalled: bool,
    reject_writes: bool,
    down: bool,
    calls: Vec<String>,
}

impl SwarmState {
    /// Replace the service's tasks with ones from its current spec.
    fn converge(&mut self, name: &str) {
        let Some(service) = self.services.get(name) else {
            return;
        };
        let template = &service.spec.task_template;
        let running = if self.broken_images.contains(&template.container_spec.image) {
            0
        } else {
            service
                .spec
                .replicas()
                .map(|r| u32::try_from(r).unwrap_or(u32::MAX))
                .unwrap_or(3)
        };
        let tasks = Tasks {
            generation: template.force_update,
            running,
        };
        self.tasks.insert(name.to_string(), tasks);
    }
}

/// Swarm engine whose services converge instantly unless told otherwise.
#[derive(Default)]
pub struct FakeSwarm {
    state: Mutex<SwarmState>,
}

#[allow(dead_code)]
impl FakeSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_image(&self, image: &str) {
        self.state.lock().broken_images.insert(image.to_string());
    }

    /// Make the engine roll back any update to `image`, as `failure_action: rollback` does.
    pub fn revert_updates_to(&self, image: &str) {
        self.state.lock().reverted_images.insert(image.to_string());
    }

    /// Accept later updates without scheduling them: the old tasks keep
    /// running and UpdateStatus keeps its previous value.
    pub fn stall_updates(&self) {
        self.state.lock().stalled = true;
    }

    pub fn reject_writes(&self) {
        self.state.lock().reject_writes = true;
    }

    pub fn take_down(&self) {
        self.state.lock().down = true;
    }

    pub fn service(&self, name: &str) -> Option<ServiceState> {
        self.state.lock().services.get(name).cloned()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().networks.contains(name)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

fn rejected(resource: &str) -> AdapterError {
    ApplySnafu {
        resource: resource.to_string(),
        message: "admission webhook denied the request".to_string(),
    }
    .build()
}

fn unreachable_platform(platform: OrchestratorKind) -> AdapterError {
    ConnectionSnafu {
        platform,
        message: "connection refused".to_string(),
    }
    .build()
}

#[async_trait]
impl SwarmApi for FakeSwarm {
    async fn info(&self) -> Result<SwarmInfo, AdapterError> {
        let state = self.state.lock();
        if state.down {
            return Err(unreachable_platform(OrchestratorKind::Swarm));
        }
        Ok(SwarmInfo {
            local_node_state: "active".to_string(),
            nodes: Some(3),
            version: Some("27.3.1".to_string()),
        })
    }

    async fn ensure_network(&self, name: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(format!("ensure_network {}", name));
        state.networks.insert(name.to_string());
        Ok(())
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceState>, AdapterError> {
        Ok(self.state.lock().services.get(name).cloned())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(format!("create {}", spec.name));
        if state.reject_writes {
            return Err(rejected(&spec.name));
        }
        state.services.insert(
            spec.name.clone(),
            ServiceState {
                version: 1,
                spec: spec.clone(),
                update_state: None,
            },
        );
        state.converge(&spec.name);
        Ok(())
    }

    async fn update_service(&self, name: &str, version: u64, spec: &ServiceSpec) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(format!("update {}", name));
        if state.reject_writes {
            return Err(rejected(name));
        }
        let stalled = state.stalled;
        let reverted = state
            .reverted_images
            .contains(&spec.task_template.container_spec.image);

        let Some(existing) = state.services.get_mut(name) else {
            return Err(rejected(name));
        };
        if existing.version != version {
            return Err(ApplySnafu {
                resource: name.to_string(),
                message: "update out of sequence".to_string(),
            }
            .build());
        }
        existing.version += 1;
        if stalled {
            existing.spec = spec.clone();
            return Ok(());
        }
        if reverted {
            // The engine restores PreviousSpec; the old tasks never stop.
            existing.update_state = Some("rollback_completed".to_string());
            return Ok(());
        }
        existing.spec = spec.clone();
        existing.update_state = Some("completed".to_string());
        state.converge(name);
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<bool, AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(format!("remove {}", name));
        state.tasks.remove(name);
        Ok(state.services.remove(name).is_some())
    }

    async fn running_tasks(&self, name: &str, generation: u64) -> Result<u32, AdapterError> {
        Ok(self
            .state
            .lock()
            .tasks
            .get(name)
            .filter(|tasks| tasks.generation == generation)
            .map_or(0, |tasks| tasks.running))
    }
}

// ---------------------------------------------------------------------------
// In-memory cluster
// ---------------------------------------------------------------------------

type ObjectKey = (ResourceKind, String, String);

#[derive(Default)]
struct ClusterState {
    objects: HashMap<ObjectKey, Value>,
    namespaces: BTreeSet<String>,
    next_version: u64,
    /// Deployments running one of these images never become available.
    stalled_images: BTreeSet<String>,
    /// Deployments running one of these images hit their progress deadline.
    deadline_images: BTreeSet<String>,
    rejected_kinds: BTreeSet<ResourceKind>,
    down: bool,
    calls: Vec<String>,
}

/// Kubernetes API server stand-in that rolls deployments out on write.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

#[allow(dead_code)]
impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall_image(&self, image: &str) {
        self.state.lock().stalled_images.insert(image.to_string());
    }

    pub fn exceed_deadline_for(&self, image: &str) {
        self.state.lock().deadline_images.insert(image.to_string());
    }

    pub fn reject(&self, kind: ResourceKind) {
        self.state.lock().rejected_kinds.insert(kind);
    }

    pub fn take_down(&self) {
        self.state.lock().down = true;
    }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.state.lock().objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().namespaces.contains(namespace)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => object["metadata"]["labels"][key] == value,
            None => !object["metadata"]["labels"][term].is_null(),
        })
}

impl ClusterState {
    /// Stamp server-side fields, and a rollout status for deployments.
    fn store(&mut self, kind: ResourceKind, namespace: &str, mut manifest: Value) -> Result<(), AdapterError> {
        let name = manifest["metadata"]["name"].as_str().unwrap_or_default().to_string();
        self.calls.push(format!("write {} {}/{}", kind.kind(), namespace, name));
        if self.rejected_kinds.contains(&kind) {
            return Err(rejected(&name));
        }
        let key = (kind, namespace.to_string(), name);
        let generation = self
            .objects
            .get(&key)
            .and_then(|old| old["metadata"]["generation"].as_u64())
            .unwrap_or(0)
            + 1;
        self.next_version += 1;
        manifest["metadata"]["generation"] = json!(generation);
        manifest["metadata"]["resourceVersion"] = json!(self.next_version.to_string());
        manifest["metadata"]["namespace"] = json!(namespace);

        if kind == ResourceKind::Deployment {
            let replicas = manifest["spec"]["replicas"].as_u64().unwrap_or(1);
            let image = manifest["spec"]["template"]["spec"]["containers"][0]["image"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let available = if self.stalled_images.contains(&image) || self.deadline_images.contains(&image) {
                0
            } else {
                replicas
            };
            let mut conditions = vec![json!({
                "type": "Available",
                "status": if available == replicas { "True" } else { "False" },
            })];
            if self.deadline_images.contains(&image) {
                conditions.push(json!({
                    "type": "Progressing",
                    "status": "False",
                    "reason": "ProgressDeadlineExceeded",
                }));
            }
            manifest["status"] = json!({
                "observedGeneration": generation,
                "replicas": replicas,
                "updatedReplicas": replicas,
                "readyReplicas": available,
                "availableReplicas": available,
                "conditions": conditions,
            });
        }
        self.objects.insert(key, manifest);
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn cluster_info(&self) -> Result<ClusterInfo, AdapterError> {
        if self.state.lock().down {
            return Err(unreachable_platform(OrchestratorKind::Cluster));
        }
        Ok(ClusterInfo {
            version: Some("v1.28.4".to_string()),
            ready_nodes: 2,
            total_nodes: 2,
            endpoint: Some("https://127.0.0.1:6443".to_string()),
        })
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AdapterError> {
        self.state.lock().namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>, AdapterError> {
        Ok(self.object(kind, namespace, name))
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, manifest: &Value) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let name = manifest["metadata"]["name"].as_str().unwrap_or_default();
        if state
            .objects
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
        {
            return Err(ApplySnafu {
                resource: name.to_string(),
                message: "already exists".to_string(),
            }
            .build());
        }
        state.store(kind, namespace, manifest.clone())
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        manifest: &Value,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        let current = state
            .objects
            .get(&key)
            .map(|o| o["metadata"]["resourceVersion"].clone());
        match current {
            Some(version) if version == manifest["metadata"]["resourceVersion"] => {
                state.store(kind, namespace, manifest.clone())
            }
            Some(_) => Err(ApplySnafu {
                resource: name.to_string(),
                message: "resourceVersion conflict".to_string(),
            }
            .build()),
            None => Err(ApplySnafu {
                resource: name.to_string(),
                message: "not found".to_string(),
            }
            .build()),
        }
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<bool, AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete {} {}/{}", kind.kind(), namespace, name));
        Ok(state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some())
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> Result<Vec<Value>, AdapterError> {
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), object)| *k == kind && ns == namespace && matches_selector(object, label_selector))
            .map(|(_, object)| object.clone())
            .collect())
    }
}
