//! Pod reconciliation against the control plane.
//!
//! Our copy of a pod can drift from the control plane's registry: the
//! pod may be gone (404), may have lost its host assignment upstream,
//! or may have been scheduled behind our back. Reconciliation reads the
//! authoritative state and folds the difference back into the core.

use tracing::{debug, error, warn};

use berthgrid_core::Pod;

use crate::error::SchedulerError;
use crate::queuer::QueuedPod;
use crate::scheduler::Scheduler;

impl Scheduler {
    /// Reconcile one pod against the control plane's current record.
    pub async fn reconcile_pod(&self, old_pod: Pod) {
        debug!(pod = %old_pod.key(), "reconciling pod");

        let current = match self.client.get_pod(&old_pod.namespace, &old_pod.name).await {
            Ok(current) => current,
            Err(err) => {
                warn!(pod = %old_pod.key(), error = %err, "aborting reconciliation");
                return;
            }
        };

        let Some(pod) = current else {
            // Gone upstream: drive the same path a delete event would.
            if let Err(err) = self.delete_one(old_pod.clone()).await {
                match err {
                    SchedulerError::NoSuchPod | SchedulerError::NoSuchTask => {}
                    other => {
                        error!(pod = %old_pod.key(), error = %other, "failed to delete pod during reconciliation");
                    }
                }
            }
            return;
        };

        if old_pod.status.host == pod.status.host {
            debug!(pod = %pod.key(), "reconciliation found no host change");
            return;
        }

        if pod.status.host.is_empty() {
            // Unscheduled upstream; we may have dropped it after a task
            // misalignment. Re-offer unless a task is still registered.
            let pod_key = pod.key();
            {
                let core = self.core.read().await;
                if core.tasks.task_for_pod(&pod_key).is_some() {
                    error!(pod = %pod_key, "task already registered for pod, not re-offering");
                    return;
                }
            }
            debug!(pod = %pod_key, "re-offering pod");
            self.queuer.reoffer(QueuedPod::due_now(pod));
        } else {
            // Scheduled behind our back; nothing sane to reconstruct.
            error!(pod = %pod.key(), host = %pod.status.host, "pod already scheduled upstream");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::scheduler::test_support::*;

    #[tokio::test]
    async fn missing_pod_routes_to_delete() {
        let f = fixture();
        let pod = test_pod("api", "u1");
        f.scheduler.handle_offers(vec![test_offer("o1", "node-1")]).await;
        f.scheduler.schedule(pod.clone()).await.unwrap();
        // Pod is absent from the control plane (never stored).

        f.scheduler.reconcile_pod(pod).await;

        assert!(f
            .scheduler
            .core
            .read()
            .await
            .tasks
            .task_for_pod("default/api")
            .is_none());
    }

    #[tokio::test]
    async fn host_cleared_upstream_reoffers_pod() {
        let f = fixture();
        let mut stale = test_pod("api", "u1");
        stale.status.host = "node-1".to_string();
        // Upstream shows the pod unscheduled again.
        f.control_plane.put_pod(test_pod("api", "u1"));

        f.scheduler.reconcile_pod(stale).await;

        let queued = f.scheduler.queuer().pod_queue.list();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].pod.name, "api");
    }

    #[tokio::test]
    async fn registered_task_blocks_reoffer() {
        let f = fixture();
        let mut stale = test_pod("api", "u1");
        stale.status.host = "node-1".to_string();
        f.control_plane.put_pod(test_pod("api", "u1"));
        {
            let mut core = f.scheduler.core.write().await;
            core.tasks
                .register(berthgrid_task::Task::new(test_pod("api", "u1")))
                .unwrap();
        }

        f.scheduler.reconcile_pod(stale).await;
        assert!(f.scheduler.queuer().pod_queue.is_empty());
    }

    #[tokio::test]
    async fn unchanged_host_is_a_noop() {
        let f = fixture();
        let pod = test_pod("api", "u1");
        f.control_plane.put_pod(pod.clone());

        f.scheduler.reconcile_pod(pod).await;
        assert!(f.scheduler.queuer().pod_queue.is_empty());
    }
}
