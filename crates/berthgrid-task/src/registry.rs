//! The pod↔task bimap with the per-task state machine.
//!
//! The registry itself carries no lock: every mutation happens under
//! the scheduler's coarse lock, which also covers the agent table.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use berthgrid_core::{RemoteTaskState, TaskStatus};

use crate::task::{Task, TaskState};

/// How long a finished record stays resolvable so late status updates
/// can still be matched.
pub const DEFAULT_FINISHED_LINGER: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("a task is already registered for pod {0}")]
    DuplicatePod(String),
}

struct Record {
    task: Task,
    state: TaskState,
    finished_at: Option<Instant>,
}

/// What a status update did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The task moved to Running.
    NowRunning { pod_key: String },
    /// The task reached a terminal state and entered its linger window.
    NowFinished { pod_key: String },
    /// A non-transition update (e.g. STARTING) was absorbed.
    Noted,
    /// The status names a task this registry does not know.
    UnknownTask,
}

/// Two-way pod↔task mapping with per-task states.
pub struct TaskRegistry {
    tasks: HashMap<String, Record>,
    pod_to_task: HashMap<String, String>,
    finished_linger: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FINISHED_LINGER)
    }
}

impl TaskRegistry {
    pub fn new(finished_linger: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            pod_to_task: HashMap::new(),
            finished_linger,
        }
    }

    /// Register a fresh task in Pending. At most one task may exist per
    /// pod at any time.
    pub fn register(&mut self, task: Task) -> Result<String, TaskError> {
        self.gc_finished();
        if self.pod_to_task.contains_key(&task.pod_key) {
            return Err(TaskError::DuplicatePod(task.pod_key.clone()));
        }
        let task_id = task.id.clone();
        debug!(%task_id, pod_key = %task.pod_key, "registering pod task");
        self.pod_to_task.insert(task.pod_key.clone(), task_id.clone());
        self.tasks.insert(
            task_id.clone(),
            Record {
                task,
                state: TaskState::Pending,
                finished_at: None,
            },
        );
        Ok(task_id)
    }

    /// Drop a task and its pod mapping entirely.
    pub fn unregister(&mut self, task_id: &str) -> Option<Task> {
        let record = self.tasks.remove(task_id)?;
        self.pod_to_task.remove(&record.task.pod_key);
        debug!(%task_id, pod_key = %record.task.pod_key, "unregistered pod task");
        Some(record.task)
    }

    pub fn get(&self, task_id: &str) -> Option<(&Task, TaskState)> {
        self.tasks.get(task_id).map(|r| (&r.task, r.state))
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<(&mut Task, TaskState)> {
        self.tasks.get_mut(task_id).map(|r| (&mut r.task, r.state))
    }

    pub fn task_for_pod(&self, pod_key: &str) -> Option<String> {
        self.pod_to_task.get(pod_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Snapshot of (task id, pod key, state) for debug endpoints.
    pub fn snapshot(&self) -> Vec<(String, String, TaskState)> {
        self.tasks
            .iter()
            .map(|(id, r)| (id.clone(), r.task.pod_key.clone(), r.state))
            .collect()
    }

    /// Apply a status update from the executor side.
    pub fn update_status(&mut self, status: &TaskStatus) -> StatusOutcome {
        self.gc_finished();
        let Some(record) = self.tasks.get_mut(&status.task_id) else {
            return StatusOutcome::UnknownTask;
        };
        match status.state {
            RemoteTaskState::Starting => StatusOutcome::Noted,
            RemoteTaskState::Running => match record.state {
                TaskState::Pending if record.task.has_launched() => {
                    record.state = TaskState::Running;
                    debug!(task_id = %status.task_id, "task running");
                    StatusOutcome::NowRunning {
                        pod_key: record.task.pod_key.clone(),
                    }
                }
                TaskState::Running => StatusOutcome::Noted,
                _ => StatusOutcome::Noted,
            },
            state if state.is_terminal() => {
                record.state = TaskState::Finished;
                record.finished_at = Some(Instant::now());
                debug!(task_id = %status.task_id, ?state, "task finished");
                StatusOutcome::NowFinished {
                    pod_key: record.task.pod_key.clone(),
                }
            }
            _ => StatusOutcome::Noted,
        }
    }

    /// The driver lost contact with the resource manager: every task's
    /// true state is now unknowable.
    pub fn mark_all_unknown(&mut self) {
        for record in self.tasks.values_mut() {
            if record.state != TaskState::Finished {
                record.state = TaskState::Unknown;
            }
        }
    }

    /// Drop finished records whose linger window has elapsed.
    pub fn gc_finished(&mut self) {
        let linger = self.finished_linger;
        let now = Instant::now();
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, r)| {
                r.finished_at
                    .is_some_and(|at| now.duration_since(at) >= linger)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in expired {
            self.unregister(&task_id);
        }
    }
}
