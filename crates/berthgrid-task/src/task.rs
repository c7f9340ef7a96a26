//! The scheduler's record of one pod's mapping to a resource grant.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use berthgrid_core::{
    OfferDetails, Pod, ResourceVector, TaskLaunch, AGENT_ID_KEY, BINDING_HOST_KEY, OFFER_ID_KEY,
    TASK_ID_KEY,
};
use berthgrid_offers::Perishable;

/// Label a pod may carry to pin itself to one agent host.
pub const HOSTNAME_LABEL: &str = "berthgrid.io/hostname";

/// Scheduler-side lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Finished,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default)]
struct TaskFlags {
    launched: bool,
    bound: bool,
    deleted: bool,
}

/// A host-port assignment taken from an accepted offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_idx: usize,
    pub port_idx: usize,
    pub offer_port: u16,
}

/// A pod-task: bridges one pod to the resource manager.
pub struct Task {
    pub id: String,
    pub pod_key: String,
    pub pod: Pod,
    /// The offer this task claimed; present between a successful
    /// placement and the launch (or release).
    pub offer: Option<Arc<Perishable>>,
    /// The launch record under construction; `data` is filled at bind.
    pub launch: Option<TaskLaunch>,
    pub ports: Vec<PortMapping>,
    flags: TaskFlags,
    /// When the current offer was accepted; feeds the bind latency
    /// summary.
    pub accepted_at: Option<Instant>,
}

impl Task {
    pub fn new(pod: Pod) -> Self {
        Self {
            id: format!("pod.{}", Uuid::new_v4()),
            pod_key: pod.key(),
            pod,
            offer: None,
            launch: None,
            ports: Vec::new(),
            flags: TaskFlags::default(),
            accepted_at: None,
        }
    }

    /// Whether this task holds a claimed offer.
    pub fn has_accepted_offer(&self) -> bool {
        self.offer.is_some()
    }

    pub fn offer_id(&self) -> Option<String> {
        self.offer.as_ref().map(|o| o.offer_id().to_string())
    }

    pub fn has_launched(&self) -> bool {
        self.flags.launched
    }

    /// Marked atomically with a successful launch call.
    pub fn set_launched(&mut self) {
        self.flags.launched = true;
    }

    pub fn has_bound(&self) -> bool {
        self.flags.bound
    }

    pub fn set_bound(&mut self) {
        self.flags.bound = true;
    }

    pub fn has_deleted(&self) -> bool {
        self.flags.deleted
    }

    /// Marked when a delete event observes an already-launched task.
    pub fn set_deleted(&mut self) {
        self.flags.deleted = true;
    }

    /// The task's acceptance predicate: resource fit plus the optional
    /// hostname pin.
    pub fn accept_offer(&self, details: &OfferDetails) -> bool {
        if let Some(required) = self.pod.labels.get(HOSTNAME_LABEL) {
            if required != &details.hostname {
                return false;
            }
        }
        if details.resources.cpus < self.pod.cpu_request() {
            return false;
        }
        if details.resources.mem_bytes < self.pod.mem_request() {
            return false;
        }
        self.pod
            .containers
            .iter()
            .flat_map(|c| &c.ports)
            .filter(|p| p.host_port != 0)
            .all(|p| details.resources.contains_port(p.host_port))
    }

    /// Record the accepted offer's resources into the launch skeleton.
    /// Assumes [`accept_offer`](Self::accept_offer) held for `details`.
    pub fn fill_from_details(&mut self, details: &OfferDetails) {
        let mut ports = Vec::new();
        let mut port_ranges = Vec::new();
        for (ci, container) in self.pod.containers.iter().enumerate() {
            for (pi, port) in container.ports.iter().enumerate() {
                if port.host_port != 0 {
                    ports.push(PortMapping {
                        container_idx: ci,
                        port_idx: pi,
                        offer_port: port.host_port,
                    });
                    port_ranges.push(berthgrid_core::PortRange {
                        begin: port.host_port,
                        end: port.host_port,
                    });
                }
            }
        }
        self.ports = ports;
        self.launch = Some(TaskLaunch {
            task_id: self.id.clone(),
            name: self.pod_key.clone(),
            agent_id: details.agent_id.clone(),
            resources: ResourceVector {
                cpus: self.pod.cpu_request(),
                mem_bytes: self.pod.mem_request(),
                ports: port_ranges,
            },
            data: Vec::new(),
        });
        self.accepted_at = Some(Instant::now());
    }

    /// Undo a placement: drop the offer claim reference, the launch
    /// skeleton, and the port assignments. The claim itself must be
    /// released by the caller beforehand.
    pub fn clear_launch(&mut self) {
        self.offer = None;
        self.launch = None;
        self.ports.clear();
        self.accepted_at = None;
    }

    /// Stamp the annotations a bound pod carries so a relaunched
    /// executor (or recovered scheduler) can re-associate task and pod.
    pub fn save_recovery_info(&self, annotations: &mut HashMap<String, String>) {
        annotations.insert(TASK_ID_KEY.to_string(), self.id.clone());
        if let Some(offer_id) = self.offer_id() {
            annotations.insert(OFFER_ID_KEY.to_string(), offer_id);
        }
        if let Some(launch) = &self.launch {
            annotations.insert(AGENT_ID_KEY.to_string(), launch.agent_id.clone());
        }
    }
}

/// Task identity recovered from a bound pod's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    pub task_id: String,
    pub offer_id: Option<String>,
    pub agent_id: Option<String>,
    pub binding_host: Option<String>,
}

impl RecoveryInfo {
    pub fn from_annotations(annotations: &HashMap<String, String>) -> Option<Self> {
        let task_id = annotations.get(TASK_ID_KEY)?.clone();
        Some(Self {
            task_id,
            offer_id: annotations.get(OFFER_ID_KEY).cloned(),
            agent_id: annotations.get(AGENT_ID_KEY).cloned(),
            binding_host: annotations.get(BINDING_HOST_KEY).cloned(),
        })
    }
}
