//! Domain types shared between the scheduler and executor sides.
//!
//! These types mirror the control plane's pod objects and the resource
//! manager's offer/task wire records. Everything that crosses a process
//! boundary is serde-serializable; task payload data is JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Annotation key recording the host a pod was bound to.
pub const BINDING_HOST_KEY: &str = "berthgrid.io/binding-host";
/// Annotation key recording the task id assigned to a bound pod.
pub const TASK_ID_KEY: &str = "berthgrid.io/task-id";
/// Annotation key recording the offer id a task was launched with.
pub const OFFER_ID_KEY: &str = "berthgrid.io/offer-id";
/// Annotation key recording the agent id a task was launched on.
pub const AGENT_ID_KEY: &str = "berthgrid.io/agent-id";

// ── Pods ──────────────────────────────────────────────────────────

/// A pod as seen by the scheduling core.
///
/// Identity is `(namespace, name, uid)`. The `uid` changes when a pod is
/// deleted and recreated under the same name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    pub status: PodStatus,
}

impl Pod {
    /// The `namespace/name` key used to index pods across the core.
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }

    /// Whether the control plane has already assigned this pod to a host.
    pub fn is_scheduled(&self) -> bool {
        !self.status.host.is_empty()
    }

    /// Sum of container CPU requests, in fractional cores.
    ///
    /// Containers without a request count at [`DEFAULT_CONTAINER_CPUS`].
    pub fn cpu_request(&self) -> f64 {
        self.containers
            .iter()
            .map(|c| {
                if c.resources.cpus > 0.0 {
                    c.resources.cpus
                } else {
                    DEFAULT_CONTAINER_CPUS
                }
            })
            .sum()
    }

    /// Sum of container memory requests, in bytes.
    pub fn mem_request(&self) -> u64 {
        self.containers
            .iter()
            .map(|c| {
                if c.resources.mem_bytes > 0 {
                    c.resources.mem_bytes
                } else {
                    DEFAULT_CONTAINER_MEM_BYTES
                }
            })
            .sum()
    }
}

/// CPU assumed for containers that do not declare a request.
pub const DEFAULT_CONTAINER_CPUS: f64 = 0.25;
/// Memory assumed for containers that do not declare a request.
pub const DEFAULT_CONTAINER_MEM_BYTES: u64 = 64 * 1024 * 1024;

/// Build the `namespace/name` pod key.
pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// The fully qualified pod name used by the node agent, which scopes
/// pods by namespace and config source.
pub fn pod_full_name(name: &str, namespace: &str, source: &str) -> String {
    format!("{name}.{namespace}.{source}")
}

/// A single container in a pod spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: ResourceRequest,
}

/// A container port declaration. `host_port == 0` means "no host port".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerPort {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Per-container resource requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceRequest {
    /// Fractional cores; 0 means unspecified.
    pub cpus: f64,
    /// Bytes; 0 means unspecified.
    pub mem_bytes: u64,
}

/// Pod runtime status as reported by the control plane or node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PodStatus {
    /// Host the pod is bound to; empty while unscheduled.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A change observed on the control plane's pod collection.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

/// A binding commits a pod to a chosen host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub namespace: String,
    pub pod_name: String,
    pub host: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// A service entry, used for bind-time environment variable injection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Environment variables a container gets for each service in its
/// namespace: `{NAME}_SERVICE_HOST` and `{NAME}_SERVICE_PORT`.
pub fn service_env_vars(services: &[Service]) -> Vec<EnvVar> {
    let mut vars = Vec::with_capacity(services.len() * 2);
    for svc in services {
        let prefix = svc.name.to_uppercase().replace('-', "_");
        vars.push(EnvVar {
            name: format!("{prefix}_SERVICE_HOST"),
            value: svc.host.clone(),
        });
        vars.push(EnvVar {
            name: format!("{prefix}_SERVICE_PORT"),
            value: svc.port.to_string(),
        });
    }
    vars
}

// ── Offers ────────────────────────────────────────────────────────

/// The resource manager's description of an offer: an opaque grant of
/// resources on one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferDetails {
    pub offer_id: String,
    pub hostname: String,
    pub agent_id: String,
    pub resources: ResourceVector,
}

/// The resource vector carried by an offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceVector {
    pub cpus: f64,
    pub mem_bytes: u64,
    #[serde(default)]
    pub ports: Vec<PortRange>,
}

impl ResourceVector {
    /// Whether `port` falls inside any of the offered port ranges.
    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.iter().any(|r| r.begin <= port && port <= r.end)
    }

    /// Lowest offered port not present in `taken`, if any.
    pub fn first_free_port(&self, taken: &[u16]) -> Option<u16> {
        for range in &self.ports {
            for port in range.begin..=range.end {
                if !taken.contains(&port) {
                    return Some(port);
                }
            }
        }
        None
    }
}

/// An inclusive port range offered by an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

// ── Tasks ─────────────────────────────────────────────────────────

/// The launch record handed to the resource manager driver.
///
/// `data` is the serialized bound pod; the executor decodes it to
/// instantiate the pod on its node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLaunch {
    pub task_id: String,
    pub name: String,
    pub agent_id: String,
    pub resources: ResourceVector,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Task state as reported over the driver, mirroring the resource
/// manager's wire states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteTaskState {
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl RemoteTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemoteTaskState::Finished
                | RemoteTaskState::Failed
                | RemoteTaskState::Killed
                | RemoteTaskState::Lost
        )
    }
}

/// A status update flowing from the executor back to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: RemoteTaskState,
    #[serde(default)]
    pub message: String,
    /// Opaque payload; the executor attaches a serialized
    /// [`PodStatusResult`] so a recovering scheduler can re-associate
    /// tasks with pods.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl TaskStatus {
    pub fn new(task_id: &str, state: RemoteTaskState, message: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            state,
            message: message.to_string(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// The payload the executor attaches to STARTING/RUNNING updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PodStatusResult {
    pub name: String,
    #[serde(default)]
    pub status: PodStatus,
}

// ── Executor-side pod hand-off ────────────────────────────────────

/// A full-set replacement of the pods the node agent should run.
#[derive(Debug, Clone, PartialEq)]
pub struct PodSnapshot {
    pub op: SnapshotOp,
    pub pods: Vec<Pod>,
}

impl PodSnapshot {
    pub fn set(pods: Vec<Pod>) -> Self {
        Self {
            op: SnapshotOp::Set,
            pods,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOp {
    Set,
}

/// A message the scheduler sends to a running executor.
///
/// The wire form is a string; `task-lost:<task-id>` acknowledges a task
/// the resource manager reported lost. Anything else is passed through
/// untyped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameworkMessage {
    TaskLost { task_id: String },
    Other(String),
}

impl FrameworkMessage {
    const TASK_LOST_PREFIX: &'static str = "task-lost:";

    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(Self::TASK_LOST_PREFIX) {
            Some(id) if !id.is_empty() => FrameworkMessage::TaskLost {
                task_id: id.to_string(),
            },
            _ => FrameworkMessage::Other(raw.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            FrameworkMessage::TaskLost { task_id } => {
                format!("{}{task_id}", Self::TASK_LOST_PREFIX)
            }
            FrameworkMessage::Other(raw) => raw.clone(),
        }
    }
}
