//! The deleter: propagate pod deletions into task kills or unregisters.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use berthgrid_core::Pod;
use berthgrid_queue::{EventTag, QueueEntry};
use berthgrid_task::TaskState;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::Scheduler;

impl Scheduler {
    /// Consume the pod-update mirror stream: deletes are handled here,
    /// everything except pops nudges the enqueue loop.
    pub(crate) fn spawn_deleter(
        self: &Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<QueueEntry<Pod>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("pod deleter started");
            loop {
                let entry = tokio::select! {
                    _ = shutdown.changed() => break,
                    entry = updates.recv() => match entry {
                        Some(entry) => entry,
                        None => break,
                    },
                };
                match entry.tag {
                    EventTag::Deleted => {
                        if let Err(err) = scheduler.delete_one(entry.value).await {
                            match err {
                                SchedulerError::NoSuchPod | SchedulerError::NoSuchTask => {
                                    debug!(error = %err, "delete event for untracked pod");
                                }
                                other => error!(error = %other, "failed to delete pod"),
                            }
                        }
                    }
                    EventTag::Popped => {}
                    _ => scheduler.queuer.updates_available(),
                }
            }
            info!("pod deleter exiting");
        })
    }

    /// Handle one pod deletion under the scheduler lock.
    ///
    /// The pod leaves the scheduling queue before the bimap lookup so a
    /// concurrent schedule cannot re-pick it between lookup and
    /// unregister.
    pub async fn delete_one(&self, pod: Pod) -> SchedulerResult<()> {
        let pod_key = pod.key();
        debug!(pod = %pod_key, "pod deleted");

        let mut core = self.core.write().await;
        self.queuer.dequeue(&pod.uid);

        let Some(task_id) = core.tasks.task_for_pod(&pod_key) else {
            debug!(pod = %pod_key, "could not resolve deleted pod to task id");
            return Err(SchedulerError::NoSuchPod);
        };

        let Some((task, state)) = core.tasks.get_mut(&task_id) else {
            return Err(SchedulerError::NoSuchTask);
        };
        match state {
            TaskState::Pending if !task.has_launched() => {
                // Deleted between schedule and bind: nothing reached
                // the resource manager yet.
                if let Some(offer) = &task.offer {
                    offer.release();
                }
                task.clear_launch();
                core.tasks.unregister(&task_id);
                Ok(())
            }
            TaskState::Pending | TaskState::Running => {
                task.set_deleted();
                drop(core);
                self.driver
                    .kill_task(&task_id)
                    .await
                    .map_err(SchedulerError::Driver)
            }
            _ => {
                debug!(pod = %pod_key, %task_id, "cannot kill pod, task not live");
                Err(SchedulerError::NoSuchTask)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::scheduler::test_support::*;
    use crate::SchedulerError;
    use berthgrid_core::Binding;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn delete_before_launch_unregisters_and_releases() {
        let f = fixture();
        let pod = test_pod("api", "u1");
        f.scheduler.handle_offers(vec![test_offer("o1", "node-1")]).await;
        f.scheduler.schedule(pod.clone()).await.unwrap();

        f.scheduler.delete_one(pod).await.unwrap();

        // The task is gone and the offer claim was released.
        assert!(f
            .scheduler
            .core
            .read()
            .await
            .tasks
            .task_for_pod("default/api")
            .is_none());
        assert!(f.scheduler.offers().get("o1").unwrap().acquire());
        assert!(f.driver.kills.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_after_launch_kills_task() {
        let f = fixture();
        let pod = test_pod("api", "u1");
        f.control_plane.put_pod(pod.clone());
        f.scheduler.handle_offers(vec![test_offer("o1", "node-1")]).await;
        let host = f.scheduler.schedule(pod.clone()).await.unwrap();
        f.scheduler
            .bind(&Binding {
                namespace: "default".to_string(),
                pod_name: "api".to_string(),
                host,
                annotations: HashMap::new(),
            })
            .await
            .unwrap();

        f.scheduler.delete_one(pod).await.unwrap();

        let core = f.scheduler.core.read().await;
        let task_id = core.tasks.task_for_pod("default/api").unwrap();
        let (task, _) = core.tasks.get(&task_id).unwrap();
        assert!(task.has_deleted());
        assert_eq!(*f.driver.kills.lock().unwrap(), vec![task_id]);
    }

    #[tokio::test]
    async fn delete_unknown_pod_is_no_such_pod() {
        let f = fixture();
        let err = f.scheduler.delete_one(test_pod("api", "u1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoSuchPod));
    }

    #[tokio::test]
    async fn bind_after_delete_observes_missing_task() {
        let f = fixture();
        let pod = test_pod("api", "u1");
        f.control_plane.put_pod(pod.clone());
        f.scheduler.handle_offers(vec![test_offer("o1", "node-1")]).await;
        let host = f.scheduler.schedule(pod.clone()).await.unwrap();

        // Delete lands between schedule and bind.
        f.scheduler.delete_one(pod).await.unwrap();

        let err = f
            .scheduler
            .bind(&Binding {
                namespace: "default".to_string(),
                pod_name: "api".to_string(),
                host,
                annotations: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoSuchPod));
        // No launch call was ever issued.
        assert!(f.driver.launches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleter_loop_consumes_delete_events() {
        let mut f = fixture();
        let pod = test_pod("api", "u1");
        f.scheduler.handle_offers(vec![test_offer("o1", "node-1")]).await;
        f.scheduler.schedule(pod.clone()).await.unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let updates = std::mem::replace(&mut f.updates, tokio::sync::mpsc::unbounded_channel().1);
        let handle = f.scheduler.spawn_deleter(updates, rx);

        f.scheduler.queuer().pod_updates.delete(pod);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if f.scheduler
                    .core
                    .read()
                    .await
                    .tasks
                    .task_for_pod("default/api")
                    .is_none()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deleter should unregister the task");

        let _ = tx.send(true);
        let _ = handle.await;
    }
}
