//! Executor tunables.

use std::time::Duration;

/// Executor configuration. The poll interval and launch grace period
/// are deployment-dependent, so both are exposed here rather than
/// hard-coded.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Config-source name scoped into pod full names.
    pub source_name: String,
    /// How often the agent is polled while waiting on (and then
    /// watching) a pod.
    pub container_poll_interval: Duration,
    /// How long a launched pod gets to reach Running before the task
    /// is reported lost.
    pub launch_grace_period: Duration,
    /// Bound on the outgoing status-update queue.
    pub outbox_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            source_name: "berthgrid".to_string(),
            container_poll_interval: Duration::from_millis(300),
            launch_grace_period: Duration::from_secs(5 * 60),
            outbox_capacity: 1024,
        }
    }
}
