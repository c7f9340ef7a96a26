//! The queuer: feeds pod updates into the scheduling queue and yields
//! pods due for scheduling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use berthgrid_core::Pod;
use berthgrid_metrics::SchedulerMetrics;
use berthgrid_queue::{DelayFifo, Delayed, EventFifo, EventTag, InsertPolicy, Keyed};

/// How long one pop attempt on the update store blocks.
pub const ENQUEUE_POP_TIMEOUT: Duration = Duration::from_millis(200);
/// How long the enqueue loop waits for an update signal after a miss.
pub const ENQUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long one pop attempt on the scheduling queue blocks.
pub const YIELD_POP_TIMEOUT: Duration = Duration::from_millis(200);
/// How long a yield waits for an unscheduled-pod signal after a miss.
pub const YIELD_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// The envelope pods wear inside the scheduling queue.
#[derive(Clone)]
pub struct QueuedPod {
    pub pod: Pod,
    /// When the pod becomes due for (re)scheduling.
    pub deadline: Instant,
    /// When the pod first entered the queue; feeds the queue-wait
    /// summary.
    pub queued_at: Instant,
    /// Optional early-release signal armed by the error handler.
    breakout: Option<watch::Receiver<bool>>,
}

impl QueuedPod {
    /// Due immediately.
    pub fn due_now(pod: Pod) -> Self {
        let now = Instant::now();
        Self {
            pod,
            deadline: now,
            queued_at: now,
            breakout: None,
        }
    }

    /// Due after a back-off delay, optionally released early when a
    /// matching offer arrives.
    pub fn with_delay(pod: Pod, delay: Duration, breakout: Option<watch::Receiver<bool>>) -> Self {
        let now = Instant::now();
        Self {
            pod,
            deadline: now + delay,
            queued_at: now,
            breakout,
        }
    }
}

impl Keyed for QueuedPod {
    // The scheduling queue is keyed by uid: a delete+recreate under the
    // same name must not collapse into one entry.
    fn key(&self) -> String {
        self.pod.uid.clone()
    }
}

impl Delayed for QueuedPod {
    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn breakout(&self) -> Option<watch::Receiver<bool>> {
        self.breakout.clone()
    }
}

/// Bridges the pod update store and the scheduling queue.
pub struct Queuer {
    /// The control plane's pod collection, with event tags.
    pub pod_updates: Arc<EventFifo<Pod>>,
    /// Pods currently eligible for scheduling, keyed by uid.
    pub pod_queue: DelayFifo<QueuedPod>,
    /// Signalled when pod updates may be waiting.
    delta: Notify,
    /// Signalled when an unscheduled pod entered the queue.
    unscheduled: Notify,
    metrics: Arc<SchedulerMetrics>,
}

impl Queuer {
    pub fn new(pod_updates: Arc<EventFifo<Pod>>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            pod_updates,
            pod_queue: DelayFifo::new(),
            delta: Notify::new(),
            unscheduled: Notify::new(),
            metrics,
        }
    }

    /// Hint that pod updates are waiting to be processed.
    pub fn updates_available(&self) {
        self.delta.notify_one();
    }

    /// Drop a pod from the scheduling queue by uid.
    pub fn dequeue(&self, uid: &str) {
        self.pod_queue.delete(uid);
    }

    /// Re-add a pod for a later attempt. KeepExisting: a newer entry
    /// for the same uid must not be overwritten with stale data.
    pub fn requeue(&self, pod: QueuedPod) {
        self.pod_queue.add(pod, InsertPolicy::KeepExisting);
        self.unscheduled.notify_one();
    }

    /// Like [`requeue`](Self::requeue), but only signals when the entry
    /// was actually accepted.
    pub fn reoffer(&self, pod: QueuedPod) {
        if self.pod_queue.offer(pod, InsertPolicy::KeepExisting) {
            self.unscheduled.notify_one();
        }
    }

    /// The enqueue loop: drain pod updates into the scheduling queue
    /// until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("watching for newly created pods");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                popped = self.pod_updates.await_pop(ENQUEUE_POP_TIMEOUT) => {
                    match popped {
                        None => {
                            // Bounded wait so scheduling can proceed even
                            // with no recent pod changes.
                            let _ = tokio::time::timeout(
                                ENQUEUE_WAIT_TIMEOUT,
                                self.delta.notified(),
                            )
                            .await;
                        }
                        Some(pod) => self.enqueue(pod),
                    }
                }
            }
        }
        info!("pod enqueue loop exiting");
    }

    fn enqueue(&self, pod: Pod) {
        if pod.is_scheduled() {
            debug!(pod = %pod.key(), "dequeuing already-scheduled pod");
            self.dequeue(&pod.uid);
        } else {
            let name = pod.name.clone();
            // ReplaceExisting: always push the latest pod state.
            if self
                .pod_queue
                .offer(QueuedPod::due_now(pod), InsertPolicy::ReplaceExisting)
            {
                self.unscheduled.notify_one();
                debug!(pod = %name, "queued pod for scheduling");
            } else {
                warn!(pod = %name, "failed to queue pod for scheduling");
            }
        }
    }

    /// Yield the next pod due for scheduling. Skips entries that were
    /// superseded in the update store or got a host assigned meanwhile.
    pub async fn yield_pod(&self) -> Pod {
        debug!("attempting to yield a pod");
        loop {
            match self.pod_queue.await_pop(YIELD_POP_TIMEOUT).await {
                None => {
                    let _ =
                        tokio::time::timeout(YIELD_WAIT_TIMEOUT, self.unscheduled.notified()).await;
                }
                Some(queued) => {
                    let name_key = queued.pod.key();
                    if !self.pod_updates.poll(&name_key, EventTag::Popped) {
                        debug!(pod = %name_key, "yield popped a transitioning pod, skipping");
                    } else if queued.pod.is_scheduled() {
                        warn!(pod = %name_key, "yield popped an already-scheduled pod, skipping");
                    } else {
                        self.metrics.queue_wait.observe(queued.queued_at.elapsed());
                        return queued.pod;
                    }
                }
            }
        }
    }
}
