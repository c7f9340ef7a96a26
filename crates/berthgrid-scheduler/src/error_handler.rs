//! Scheduling-error handling: per-pod back-off and offer-arrival
//! breakout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use berthgrid_core::Pod;
use berthgrid_task::TaskState;

use crate::error::SchedulerError;
use crate::queuer::QueuedPod;
use crate::scheduler::Scheduler;

struct BackoffEntry {
    delay: Duration,
    last_update: Instant,
}

/// Per-pod geometric back-off: `delay_{n+1} = min(2·delay_n, max)`,
/// resetting to the default once a pod has been quiet for `max`.
pub struct PodBackoff {
    entries: Mutex<HashMap<String, BackoffEntry>>,
    default_delay: Duration,
    max_delay: Duration,
}

impl PodBackoff {
    pub fn new(default_delay: Duration, max_delay: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_delay,
            max_delay,
        }
    }

    /// Current delay for the pod; doubles the stored delay for the next
    /// call, capped at the maximum.
    pub fn next_delay(&self, pod_key: &str) -> Duration {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(pod_key.to_string()).or_insert(BackoffEntry {
            delay: self.default_delay,
            last_update: Instant::now(),
        });
        let delay = entry.delay;
        entry.delay = (entry.delay * 2).min(self.max_delay);
        entry.last_update = Instant::now();
        delay
    }

    /// Drop entries idle longer than the maximum delay.
    pub fn gc(&self) {
        let horizon = self.max_delay;
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| now.duration_since(e.last_update) < horizon);
    }
}

impl Scheduler {
    /// Route a scheduling (or binding) failure: terminal errors drop
    /// the pod; everything else requeues with back-off, and a lack of
    /// suitable offers additionally arms an offer-arrival breakout.
    pub async fn handle_scheduling_error(self: &Arc<Self>, pod: Pod, err: &SchedulerError) {
        if err.is_terminal() {
            debug!(pod = %pod.key(), error = %err, "not rescheduling pod");
            return;
        }
        info!(pod = %pod.key(), error = %err, "error scheduling pod, retrying");

        let pod_key = pod.key();
        self.backoff.gc();

        let breakout = {
            let core = self.core.read().await;
            let Some(task_id) = core.tasks.task_for_pod(&pod_key) else {
                // Someone deleted the pod; nothing to reschedule.
                debug!(pod = %pod_key, "could not resolve pod to task, aborting reschedule");
                return;
            };
            let Some((task, TaskState::Pending)) = core.tasks.get(&task_id) else {
                debug!(pod = %pod_key, "task is no longer pending, aborting reschedule");
                return;
            };
            if task.has_launched() {
                debug!(pod = %pod_key, "skipping reschedule for already-launched pod");
                return;
            }

            if matches!(err, SchedulerError::NoSuitableOffers) {
                debug!(pod = %pod_key, "arming back-off breakout for pod");
                Some(self.arm_offer_breakout(&pod_key, task_id))
            } else {
                None
            }
        };

        let delay = self.backoff.next_delay(&pod_key);
        debug!(pod = %pod_key, ?delay, "requeuing pod");
        self.queuer
            .requeue(QueuedPod::with_delay(pod, delay, breakout));
    }

    /// Register an offer listener whose filter re-checks the task under
    /// the scheduler lock: only a still-pending, not-yet-launched task
    /// keeps watching for an acceptable offer.
    fn arm_offer_breakout(
        self: &Arc<Self>,
        pod_key: &str,
        task_id: String,
    ) -> tokio::sync::watch::Receiver<bool> {
        let weak = Arc::downgrade(self);
        self.offers.listen(
            pod_key,
            Arc::new(move |details| {
                let Some(scheduler) = weak.upgrade() else {
                    return true;
                };
                // The notification loop runs concurrently with the
                // scheduler lock; a contended read just defers the
                // match to the next sweep.
                let Ok(core) = scheduler.core.try_read() else {
                    return false;
                };
                match core.tasks.get(&task_id) {
                    Some((task, TaskState::Pending)) => {
                        !task.has_launched() && task.accept_offer(details)
                    }
                    // No point continuing to check for matching offers.
                    _ => true,
                }
            }),
        )
    }
}
