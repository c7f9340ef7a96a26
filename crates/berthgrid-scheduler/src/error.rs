//! Scheduler error types.

use thiserror::Error;

use berthgrid_core::{ClientError, DriverError};

/// Errors that can occur while scheduling, binding, or deleting pods.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The pod no longer exists; terminal, never retried.
    #[error("no such pod")]
    NoSuchPod,

    /// The pod resolves to no live task; terminal, never retried.
    #[error("no such task")]
    NoSuchTask,

    /// No live offer satisfied the task's acceptance predicate.
    #[error("no suitable offers for task")]
    NoSuitableOffers,

    /// The accepted offer expired or was invalidated before launch.
    #[error("offer {0} expired before launch")]
    ExpiredOffer(String),

    /// The chosen offer's agent vanished from the agent table.
    #[error("agent {agent_id} disappeared while scheduling task {task_id}")]
    AgentDisappeared { agent_id: String, task_id: String },

    /// The task's pod spec diverged from the pod being scheduled.
    #[error("task {task_id} spec is out of sync with pod {pod_key}")]
    TaskMismatch { task_id: String, pod_key: String },

    /// The task was already handed to the resource manager.
    #[error("task {0} has already been launched")]
    AlreadyLaunched(String),

    /// The task left Pending; there is nothing to schedule or bind.
    #[error("task {0} is not pending")]
    NotPending(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("control plane error: {0}")]
    ControlPlane(#[from] ClientError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A broken internal invariant; fail fast, never retried.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Terminal errors are dropped by the error handler instead of
    /// requeued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerError::NoSuchPod | SchedulerError::NoSuchTask)
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
