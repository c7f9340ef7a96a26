//! Bind: commit a scheduled pod-task to its chosen host and launch it.

use tracing::{debug, info, warn};

use berthgrid_core::{pod_key, service_env_vars, Binding, BINDING_HOST_KEY};
use berthgrid_task::TaskState;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{SchedCore, Scheduler};

impl Scheduler {
    /// Bind the pod named by `binding` to `binding.host` and launch the
    /// task. Requires a prior successful [`Scheduler::schedule`]; the
    /// offer is re-validated under the lock because it may have expired
    /// or been rescinded in between.
    pub async fn bind(&self, binding: &Binding) -> SchedulerResult<()> {
        let pod_key = pod_key(&binding.namespace, &binding.pod_name);
        let mut core = self.core.write().await;

        let Some(task_id) = core.tasks.task_for_pod(&pod_key) else {
            info!(pod = %pod_key, "could not resolve pod to task id");
            return Err(SchedulerError::NoSuchPod);
        };
        match core.tasks.get(&task_id) {
            Some((_, TaskState::Pending)) => {}
            _ => {
                // Most likely deleted between schedule and bind.
                info!(pod = %pod_key, "no pending task for pod");
                return Err(SchedulerError::NoSuchPod);
            }
        }

        let (offer, accepted_at) = {
            let (task, _) = core
                .tasks
                .get(&task_id)
                .ok_or_else(|| SchedulerError::Internal("bimap out of sync".to_string()))?;
            let Some(offer) = task.offer.clone() else {
                // Should never happen after a successful schedule.
                return Err(SchedulerError::Internal(format!(
                    "task {task_id} has not accepted a valid offer"
                )));
            };
            (offer, task.accepted_at)
        };
        let offer_id = offer.offer_id().to_string();

        // The agent may have disconnected or the offer aged out since
        // schedule returned.
        let still_valid = self
            .offers
            .get(&offer_id)
            .is_some_and(|current| !current.has_expired());
        if !still_valid {
            offer.release();
            if let Some((task, _)) = core.tasks.get_mut(&task_id) {
                task.clear_launch();
            }
            return Err(SchedulerError::ExpiredOffer(offer_id));
        }

        match self
            .prepare_and_launch(&mut core, &task_id, &offer_id, &binding.host)
            .await
        {
            Ok(()) => {
                self.offers.invalidate_one(&offer_id);
                if let Some((task, _)) = core.tasks.get_mut(&task_id) {
                    task.pod.status.host = binding.host.clone();
                    task.set_launched();
                    task.set_bound();
                }
                if let Some(at) = accepted_at {
                    self.metrics.bind_latency.observe(at.elapsed());
                }
                info!(pod = %pod_key, host = %binding.host, %task_id, "task launched");
                Ok(())
            }
            Err(err) => {
                warn!(pod = %pod_key, %task_id, error = %err, "failed to launch task");
                offer.release();
                if let Some((task, _)) = core.tasks.get_mut(&task_id) {
                    task.clear_launch();
                }
                Err(err)
            }
        }
    }

    /// Build the bound pod payload and hand the task to the driver.
    async fn prepare_and_launch(
        &self,
        core: &mut SchedCore,
        task_id: &str,
        offer_id: &str,
        host: &str,
    ) -> SchedulerResult<()> {
        let (namespace, name) = {
            let (task, _) = core
                .tasks
                .get(task_id)
                .ok_or_else(|| SchedulerError::Internal("bimap out of sync".to_string()))?;
            (task.pod.namespace.clone(), task.pod.name.clone())
        };

        // Always launch from the control plane's current spec, not the
        // snapshot we queued.
        let fresh = self
            .client
            .get_pod(&namespace, &name)
            .await?
            .ok_or(SchedulerError::NoSuchPod)?;
        let env = service_env_vars(&self.client.list_services(&namespace).await?);

        let (task, _) = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::Internal("bimap out of sync".to_string()))?;

        let mut bound = fresh;
        for container in &mut bound.containers {
            container.env.extend(env.iter().cloned());
        }
        bound
            .annotations
            .insert(BINDING_HOST_KEY.to_string(), host.to_string());
        task.save_recovery_info(&mut bound.annotations);

        // Rewrite container host ports to the offer's allocations.
        for mapping in &task.ports {
            if let Some(port) = bound
                .containers
                .get_mut(mapping.container_idx)
                .and_then(|c| c.ports.get_mut(mapping.port_idx))
            {
                port.host_port = mapping.offer_port;
            }
        }

        let launch = {
            let record = task.launch.as_mut().ok_or_else(|| {
                SchedulerError::Internal(format!("task {task_id} has no launch record"))
            })?;
            record.data = serde_json::to_vec(&bound)?;
            record.clone()
        };

        debug!(%task_id, %offer_id, "launching task");
        self.driver
            .launch_tasks(&[offer_id.to_string()], &[launch])
            .await?;
        Ok(())
    }
}
