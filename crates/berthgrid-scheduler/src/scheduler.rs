//! The scheduler core: owns the pod-task bimap and agent table, runs
//! the schedule step, and reacts to driver events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use berthgrid_core::{
    Binding, ControlPlane, OfferDetails, Pod, PodEvent, RemoteTaskState, SchedulerDriver,
    TaskStatus,
};
use berthgrid_metrics::SchedulerMetrics;
use berthgrid_offers::OfferRegistry;
use berthgrid_queue::{EventFifo, EventTag, QueueEntry};
use berthgrid_task::{StatusOutcome, Task, TaskRegistry, TaskState, DEFAULT_FINISHED_LINGER};

use crate::error::{SchedulerError, SchedulerResult};
use crate::error_handler::PodBackoff;
use crate::placement::Placement;
use crate::queuer::Queuer;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long finished task records stay resolvable.
    pub finished_linger: Duration,
    /// First back-off delay after a scheduling failure.
    pub backoff_default: Duration,
    /// Back-off ceiling; also the entry GC horizon.
    pub backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            finished_linger: DEFAULT_FINISHED_LINGER,
            backoff_default: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// State guarded by the scheduler's coarse lock: the pod-task bimap and
/// the agent table.
pub struct SchedCore {
    pub tasks: TaskRegistry,
    /// agent id → hostname; populated on offer arrival, never GC'd.
    pub agents: HashMap<String, String>,
}

/// The framework-side scheduler.
pub struct Scheduler {
    pub(crate) core: RwLock<SchedCore>,
    pub(crate) offers: Arc<OfferRegistry>,
    pub(crate) driver: Arc<dyn SchedulerDriver>,
    pub(crate) client: Arc<dyn ControlPlane>,
    pub(crate) queuer: Arc<Queuer>,
    pub(crate) placement: Arc<dyn Placement>,
    pub(crate) backoff: PodBackoff,
    pub(crate) metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    /// Build a scheduler and the mirror stream of pod-update events the
    /// deleter consumes (hand it back to [`Scheduler::spawn`]).
    pub fn new(
        config: SchedulerConfig,
        offers: Arc<OfferRegistry>,
        driver: Arc<dyn SchedulerDriver>,
        client: Arc<dyn ControlPlane>,
        placement: Arc<dyn Placement>,
        metrics: Arc<SchedulerMetrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueEntry<Pod>>) {
        let (mirror_tx, mirror_rx) = mpsc::unbounded_channel();
        let pod_updates = Arc::new(EventFifo::new().with_mirror(mirror_tx));
        let queuer = Arc::new(Queuer::new(pod_updates, metrics.clone()));
        let scheduler = Arc::new(Self {
            core: RwLock::new(SchedCore {
                tasks: TaskRegistry::new(config.finished_linger),
                agents: HashMap::new(),
            }),
            offers,
            driver,
            client,
            queuer,
            placement,
            backoff: PodBackoff::new(config.backoff_default, config.backoff_max),
            metrics,
        });
        (scheduler, mirror_rx)
    }

    pub fn queuer(&self) -> &Arc<Queuer> {
        &self.queuer
    }

    pub fn offers(&self) -> &Arc<OfferRegistry> {
        &self.offers
    }

    /// Apply one pod event from the control plane's watch stream.
    pub fn handle_pod_event(&self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) => self.queuer.pod_updates.add(pod),
            PodEvent::Modified(pod) => self.queuer.pod_updates.update(pod),
            PodEvent::Deleted(pod) => self.queuer.pod_updates.delete(pod),
        }
    }

    /// Record the offering agents, then hand the offers to the registry.
    pub async fn handle_offers(&self, details: Vec<OfferDetails>) {
        {
            let mut core = self.core.write().await;
            for d in &details {
                core.agents
                    .entry(d.agent_id.clone())
                    .or_insert_with(|| d.hostname.clone());
            }
        }
        self.offers.add(details);
    }

    /// The resource manager took an offer back.
    pub async fn handle_offer_rescinded(&self, offer_id: &str) {
        self.offers.delete(offer_id).await;
    }

    /// The driver lost its connection: task states are unknowable.
    pub async fn handle_driver_disconnected(&self) {
        warn!("driver disconnected, marking all tasks unknown");
        self.core.write().await.tasks.mark_all_unknown();
    }

    /// Apply a task status update from the executor side. Failed and
    /// lost tasks route their pods through reconciliation so they can
    /// revert to unscheduled.
    pub async fn handle_status_update(self: &Arc<Self>, status: TaskStatus) {
        let reconcile = {
            let mut core = self.core.write().await;
            let outcome = core.tasks.update_status(&status);
            match outcome {
                StatusOutcome::UnknownTask => {
                    warn!(task_id = %status.task_id, state = ?status.state, "status update for unknown task");
                    None
                }
                StatusOutcome::NowFinished { pod_key } => {
                    debug!(task_id = %status.task_id, %pod_key, state = ?status.state, "task reached terminal state");
                    if matches!(
                        status.state,
                        RemoteTaskState::Failed | RemoteTaskState::Lost
                    ) {
                        core.tasks
                            .get(&status.task_id)
                            .map(|(task, _)| task.pod.clone())
                    } else {
                        None
                    }
                }
                StatusOutcome::NowRunning { pod_key } => {
                    debug!(task_id = %status.task_id, %pod_key, "task running");
                    None
                }
                StatusOutcome::Noted => None,
            }
        };
        if let Some(pod) = reconcile {
            self.reconcile_pod(pod).await;
        }
    }

    /// Schedule a pod: resolve (or register) its task, run placement,
    /// and return the chosen hostname.
    pub async fn schedule(&self, pod: Pod) -> SchedulerResult<String> {
        let pod_key = pod.key();
        info!(pod = %pod_key, "trying to schedule pod");

        let mut core = self.core.write().await;
        match core.tasks.task_for_pod(&pod_key) {
            None => {
                // The pod could have been yielded and then deleted
                // before we got here.
                if self.queuer.pod_updates.poll(&pod_key, EventTag::Deleted) {
                    debug!(pod = %pod_key, "aborting schedule, pod has been deleted");
                    return Err(SchedulerError::NoSuchPod);
                }
                let task_id = core
                    .tasks
                    .register(Task::new(pod))
                    .map_err(|e| SchedulerError::Internal(e.to_string()))?;
                self.do_schedule(&mut core, &task_id)
            }
            Some(task_id) => {
                let (task, state) = core
                    .tasks
                    .get(&task_id)
                    .ok_or_else(|| SchedulerError::Internal("bimap out of sync".to_string()))?;
                match state {
                    TaskState::Pending => {
                        if pod.uid != task.pod.uid {
                            // Brand-new pod spec under an old mapping:
                            // the task store is out of sync with reality.
                            Err(SchedulerError::TaskMismatch { task_id, pod_key })
                        } else if task.has_launched() {
                            Err(SchedulerError::AlreadyLaunched(task_id))
                        } else {
                            self.do_schedule(&mut core, &task_id)
                        }
                    }
                    _ => Err(SchedulerError::NotPending(task_id)),
                }
            }
        }
    }

    fn do_schedule(&self, core: &mut SchedCore, task_id: &str) -> SchedulerResult<String> {
        let offer = {
            let (task, _) = core
                .tasks
                .get(task_id)
                .ok_or_else(|| SchedulerError::Internal("task vanished mid-schedule".to_string()))?;
            self.placement.place(&self.offers, task)?
        };
        let Some(details) = offer.details().cloned() else {
            return Err(SchedulerError::ExpiredOffer(offer.offer_id().to_string()));
        };
        let agent_host = core.agents.get(&details.agent_id).cloned();
        let (task, _) = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::Internal("task vanished mid-schedule".to_string()))?;
        match agent_host {
            None => {
                // The offer's owner died; release for claim accounting
                // and retire the offer.
                offer.release();
                self.offers.invalidate_one(&details.offer_id);
                task.clear_launch();
                Err(SchedulerError::AgentDisappeared {
                    agent_id: details.agent_id,
                    task_id: task_id.to_string(),
                })
            }
            Some(host) => {
                if let Some(existing) = &task.offer {
                    if existing.offer_id() != offer.offer_id() {
                        return Err(SchedulerError::Internal(
                            "task offer assignment must be idempotent".to_string(),
                        ));
                    }
                }
                task.offer = Some(offer);
                task.fill_from_details(&details);
                Ok(host)
            }
        }
    }

    /// Spawn all background loops: offer aging/notification, the
    /// enqueue loop, the deleter, and the schedule→bind driving loop.
    pub fn spawn(
        self: &Arc<Self>,
        updates: mpsc::UnboundedReceiver<QueueEntry<Pod>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = self.offers.spawn_loops(shutdown.clone());
        handles.push({
            let queuer = self.queuer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queuer.run(shutdown).await })
        });
        handles.push(self.spawn_deleter(updates, shutdown.clone()));
        handles.push({
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_scheduling_loop(shutdown).await })
        });
        handles
    }

    /// Yield → schedule → bind, routing failures to the error handler.
    async fn run_scheduling_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduling loop started");
        loop {
            let pod = tokio::select! {
                _ = shutdown.changed() => break,
                pod = self.queuer.yield_pod() => pod,
            };
            let binding_skeleton = Binding {
                namespace: pod.namespace.clone(),
                pod_name: pod.name.clone(),
                host: String::new(),
                annotations: HashMap::new(),
            };
            match self.schedule(pod.clone()).await {
                Ok(host) => {
                    let binding = Binding {
                        host,
                        ..binding_skeleton
                    };
                    if let Err(err) = self.bind(&binding).await {
                        self.handle_scheduling_error(pod, &err).await;
                    }
                }
                Err(err) => self.handle_scheduling_error(pod, &err).await,
            }
        }
        info!("scheduling loop exiting");
    }

    /// Snapshot of (task id, pod key, state) for the debug endpoints.
    pub async fn tasks_snapshot(&self) -> Vec<(String, String, TaskState)> {
        self.core.read().await.tasks.snapshot()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for the scheduler-side unit tests.

    use super::*;
    use async_trait::async_trait;
    use berthgrid_core::{
        ClientResult, ContainerPort, ContainerSpec, DriverResult, PodStatus, PortRange,
        ResourceRequest, ResourceVector, Service, TaskLaunch,
    };
    use berthgrid_metrics::OfferMetrics;
    use berthgrid_offers::{DeclineFn, RegistryConfig};
    use crate::placement::FirstFit;
    use std::sync::Mutex;

    /// Driver that records calls and optionally fails launches.
    #[derive(Default)]
    pub struct RecordingDriver {
        pub launches: Mutex<Vec<(Vec<String>, Vec<TaskLaunch>)>>,
        pub kills: Mutex<Vec<String>>,
        pub declines: Mutex<Vec<String>>,
        pub fail_launch: Mutex<bool>,
    }

    #[async_trait]
    impl SchedulerDriver for RecordingDriver {
        async fn launch_tasks(
            &self,
            offer_ids: &[String],
            tasks: &[TaskLaunch],
        ) -> DriverResult<()> {
            if *self.fail_launch.lock().unwrap() {
                return Err(berthgrid_core::DriverError::Call("launch refused".to_string()));
            }
            self.launches
                .lock()
                .unwrap()
                .push((offer_ids.to_vec(), tasks.to_vec()));
            Ok(())
        }

        async fn kill_task(&self, task_id: &str) -> DriverResult<()> {
            self.kills.lock().unwrap().push(task_id.to_string());
            Ok(())
        }

        async fn decline_offer(&self, offer_id: &str) -> DriverResult<()> {
            self.declines.lock().unwrap().push(offer_id.to_string());
            Ok(())
        }

        async fn send_framework_message(&self, _agent_id: &str, _message: &str) -> DriverResult<()> {
            Ok(())
        }
    }

    /// Control plane backed by an in-memory pod map.
    #[derive(Default)]
    pub struct FakeControlPlane {
        pub pods: Mutex<HashMap<String, Pod>>,
        pub services: Mutex<Vec<Service>>,
        pub bindings: Mutex<Vec<Binding>>,
    }

    impl FakeControlPlane {
        pub fn put_pod(&self, pod: Pod) {
            self.pods.lock().unwrap().insert(pod.key(), pod);
        }

        pub fn remove_pod(&self, key: &str) {
            self.pods.lock().unwrap().remove(key);
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn post_binding(&self, binding: &Binding) -> ClientResult<()> {
            self.bindings.lock().unwrap().push(binding.clone());
            Ok(())
        }

        async fn get_pod(&self, namespace: &str, name: &str) -> ClientResult<Option<Pod>> {
            let key = berthgrid_core::pod_key(namespace, name);
            Ok(self.pods.lock().unwrap().get(&key).cloned())
        }

        async fn list_pods(&self) -> ClientResult<Vec<Pod>> {
            Ok(self.pods.lock().unwrap().values().cloned().collect())
        }

        async fn list_services(&self, namespace: &str) -> ClientResult<Vec<Service>> {
            Ok(self
                .services
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.namespace == namespace)
                .cloned()
                .collect())
        }
    }

    pub struct Fixture {
        pub scheduler: Arc<Scheduler>,
        pub updates: mpsc::UnboundedReceiver<QueueEntry<Pod>>,
        pub driver: Arc<RecordingDriver>,
        pub control_plane: Arc<FakeControlPlane>,
    }

    pub fn fixture() -> Fixture {
        fixture_with_ttl(Duration::from_secs(30))
    }

    pub fn fixture_with_ttl(ttl: Duration) -> Fixture {
        let driver = Arc::new(RecordingDriver::default());
        let control_plane = Arc::new(FakeControlPlane::default());
        let decline: DeclineFn = {
            let driver = driver.clone();
            Arc::new(move |offer_id: String| {
                let driver = driver.clone();
                Box::pin(async move { driver.decline_offer(&offer_id).await })
            })
        };
        let mut registry_config = RegistryConfig::new(decline);
        registry_config.ttl = ttl;
        registry_config.listener_delay = Duration::from_millis(20);
        registry_config.id_cache_ttl = Duration::from_millis(20);
        let offers = Arc::new(OfferRegistry::new(
            registry_config,
            Arc::new(OfferMetrics::new()),
        ));
        let (scheduler, updates) = Scheduler::new(
            SchedulerConfig::default(),
            offers,
            driver.clone(),
            control_plane.clone(),
            Arc::new(FirstFit),
            Arc::new(SchedulerMetrics::new()),
        );
        Fixture {
            scheduler,
            updates,
            driver,
            control_plane,
        }
    }

    pub fn test_pod(name: &str, uid: &str) -> Pod {
        Pod {
            namespace: "default".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            annotations: HashMap::new(),
            labels: HashMap::new(),
            containers: vec![ContainerSpec {
                name: "main".to_string(),
                image: "registry/app:1".to_string(),
                ports: vec![ContainerPort {
                    container_port: 8080,
                    host_port: 31500,
                }],
                env: Vec::new(),
                resources: ResourceRequest {
                    cpus: 1.0,
                    mem_bytes: 64 * 1024 * 1024,
                },
            }],
            status: PodStatus::default(),
        }
    }

    pub fn test_offer(id: &str, host: &str) -> OfferDetails {
        OfferDetails {
            offer_id: id.to_string(),
            hostname: host.to_string(),
            agent_id: format!("agent-{host}"),
            resources: ResourceVector {
                cpus: 4.0,
                mem_bytes: 1 << 30,
                ports: vec![PortRange {
                    begin: 31000,
                    end: 32000,
                }],
            },
        }
    }
}
