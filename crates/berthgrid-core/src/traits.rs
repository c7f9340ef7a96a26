//! Capability interfaces at the edges of the core.
//!
//! The scheduler and executor only ever touch the resource manager, the
//! control plane, and the node agent through these traits. That keeps the
//! wire protocols out of the core and makes every collaborator mockable.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Binding, Pod, PodStatus, Service, TaskLaunch, TaskStatus};

/// Errors surfaced by the resource manager driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver has aborted; no further calls will succeed.
    #[error("driver aborted")]
    Aborted,
    /// The driver is not connected to the resource manager.
    #[error("driver disconnected")]
    Disconnected,
    #[error("driver call failed: {0}")]
    Call(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// The scheduler-side driver surface of the resource manager.
///
/// The driver itself is thread-safe; calls may be issued concurrently.
#[async_trait]
pub trait SchedulerDriver: Send + Sync {
    /// Launch tasks against previously received offers. Consumes the offers.
    async fn launch_tasks(&self, offer_ids: &[String], tasks: &[TaskLaunch]) -> DriverResult<()>;

    /// Ask the resource manager to kill a launched task.
    async fn kill_task(&self, task_id: &str) -> DriverResult<()>;

    /// Decline an offer without launching anything on it.
    async fn decline_offer(&self, offer_id: &str) -> DriverResult<()>;

    /// Send an out-of-band message to the executor on an agent.
    async fn send_framework_message(&self, agent_id: &str, message: &str) -> DriverResult<()>;
}

/// The executor-side driver surface of the resource manager.
#[async_trait]
pub trait ExecutorDriver: Send + Sync {
    async fn send_status(&self, status: TaskStatus) -> DriverResult<()>;

    async fn send_framework_message(&self, message: &str) -> DriverResult<()>;
}

/// Errors from the control plane client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("control plane returned status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// The narrow REST surface of the control plane the core consumes.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Record a pod→host binding in the binding's namespace.
    async fn post_binding(&self, binding: &Binding) -> ClientResult<()>;

    /// Fetch the current authoritative spec of one pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> ClientResult<Option<Pod>>;

    /// List every pod visible to the scheduler.
    async fn list_pods(&self) -> ClientResult<Vec<Pod>>;

    /// List the services of a namespace, for env-var injection at bind time.
    async fn list_services(&self, namespace: &str) -> ClientResult<Vec<Service>>;
}

/// Errors from the node agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent has no record of the pod.
    #[error("unknown pod: {0}")]
    UnknownPod(String),
    #[error("agent call failed: {0}")]
    Call(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// The node agent surface the executor consumes.
///
/// Pod hand-off happens over a channel of [`crate::types::PodSnapshot`]
/// values owned by the executor; this trait only covers status probes.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Current status of a pod, or [`AgentError::UnknownPod`] once the
    /// agent has no record of it.
    async fn pod_status(&self, pod_full_name: &str) -> AgentResult<PodStatus>;
}

/// The container runtime surface used during executor shutdown.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Force-remove every container managed by the agent. Returns the
    /// number of containers removed.
    async fn remove_managed_containers(&self) -> AgentResult<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        assert_eq!(DriverError::Aborted.to_string(), "driver aborted");
        assert_eq!(
            DriverError::Call("timed out".to_string()).to_string(),
            "driver call failed: timed out"
        );
    }

    #[test]
    fn client_error_display() {
        assert_eq!(
            ClientError::NotFound("default/api".to_string()).to_string(),
            "resource not found: default/api"
        );
        assert_eq!(ClientError::Status(503).to_string(), "control plane returned status 503");
    }
}
