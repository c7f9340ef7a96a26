//! The standalone development loop.
//!
//! Wires a scheduler and an executor together inside one process:
//!
//! - an in-process driver pair forwards launch/kill calls one way and
//!   status updates the other;
//! - a simulated node agent accepts pod-set snapshots and reports pods
//!   Running after a configurable startup delay;
//! - a synthetic offer feed stands in for the resource manager's offer
//!   stream.
//!
//! None of this defines a wire protocol; it exists to drive the real
//! scheduler/executor code paths locally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use berthgrid_core::{
    AgentError, AgentResult, Binding, ClientResult, ContainerRuntime, ControlPlane, DriverResult,
    NodeAgent, OfferDetails, Pod, PodEvent, PodPhase, PodSnapshot, PodStatus, PortRange,
    ResourceVector, SchedulerDriver, Service, TaskLaunch, TaskStatus,
};
use berthgrid_executor::{Executor, ExecutorConfig};
use berthgrid_metrics::{OfferMetrics, SchedulerMetrics};
use berthgrid_offers::{DeclineFn, OfferRegistry, RegistryConfig};
use berthgrid_scheduler::{debug_router, FirstFit, Scheduler, SchedulerConfig};

pub struct DevLoopConfig {
    pub offer_ttl: Duration,
    pub offer_interval: Duration,
    pub node_name: String,
    pub startup_delay: Duration,
}

// ── In-memory control plane ───────────────────────────────────────

#[derive(Default)]
struct DevControlPlane {
    pods: Mutex<HashMap<String, Pod>>,
    services: Mutex<Vec<Service>>,
}

impl DevControlPlane {
    fn put_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod.key(), pod);
    }

    fn remove_pod(&self, key: &str) -> Option<Pod> {
        self.pods.lock().unwrap().remove(key)
    }

    fn list(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl ControlPlane for DevControlPlane {
    async fn post_binding(&self, binding: &Binding) -> ClientResult<()> {
        let key = berthgrid_core::pod_key(&binding.namespace, &binding.pod_name);
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod) = pods.get_mut(&key) {
            pod.status.host = binding.host.clone();
            for (k, v) in &binding.annotations {
                pod.annotations.insert(k.clone(), v.clone());
            }
        }
        info!(pod = %key, host = %binding.host, "binding recorded");
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClientResult<Option<Pod>> {
        let key = berthgrid_core::pod_key(namespace, name);
        Ok(self.pods.lock().unwrap().get(&key).cloned())
    }

    async fn list_pods(&self) -> ClientResult<Vec<Pod>> {
        Ok(self.list())
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

// ── Simulated node agent ──────────────────────────────────────────

struct DevAgent {
    pods: Mutex<HashMap<String, (Instant, Pod)>>,
    startup_delay: Duration,
    source_name: String,
}

impl DevAgent {
    fn new(startup_delay: Duration, source_name: String) -> Arc<Self> {
        Arc::new(Self {
            pods: Mutex::new(HashMap::new()),
            startup_delay,
            source_name,
        })
    }

    /// Apply a full-set snapshot, keeping start times of surviving pods.
    fn apply(&self, snapshot: PodSnapshot) {
        let mut pods = self.pods.lock().unwrap();
        let mut next = HashMap::new();
        for pod in snapshot.pods {
            let full_name =
                berthgrid_core::pod_full_name(&pod.name, &pod.namespace, &self.source_name);
            let since = pods
                .get(&full_name)
                .map(|(since, _)| *since)
                .unwrap_or_else(Instant::now);
            next.insert(full_name, (since, pod));
        }
        *pods = next;
    }
}

#[async_trait]
impl NodeAgent for DevAgent {
    async fn pod_status(&self, pod_full_name: &str) -> AgentResult<PodStatus> {
        let pods = self.pods.lock().unwrap();
        let (since, _) = pods
            .get(pod_full_name)
            .ok_or_else(|| AgentError::UnknownPod(pod_full_name.to_string()))?;
        let phase = if since.elapsed() >= self.startup_delay {
            PodPhase::Running
        } else {
            PodPhase::Pending
        };
        Ok(PodStatus {
            host: "local".to_string(),
            phase,
            message: String::new(),
        })
    }
}

struct DevRuntime;

#[async_trait]
impl ContainerRuntime for DevRuntime {
    async fn remove_managed_containers(&self) -> AgentResult<u32> {
        Ok(0)
    }
}

// ── In-process driver pair ────────────────────────────────────────

enum DriverCommand {
    Launch(Vec<TaskLaunch>),
    Kill(String),
    Message(String),
}

struct LoopbackSchedulerDriver {
    commands: mpsc::UnboundedSender<DriverCommand>,
}

#[async_trait]
impl SchedulerDriver for LoopbackSchedulerDriver {
    async fn launch_tasks(&self, _offer_ids: &[String], tasks: &[TaskLaunch]) -> DriverResult<()> {
        let _ = self.commands.send(DriverCommand::Launch(tasks.to_vec()));
        Ok(())
    }

    async fn kill_task(&self, task_id: &str) -> DriverResult<()> {
        let _ = self.commands.send(DriverCommand::Kill(task_id.to_string()));
        Ok(())
    }

    async fn decline_offer(&self, offer_id: &str) -> DriverResult<()> {
        debug!(%offer_id, "synthetic offer declined");
        Ok(())
    }

    async fn send_framework_message(&self, _agent_id: &str, message: &str) -> DriverResult<()> {
        let _ = self
            .commands
            .send(DriverCommand::Message(message.to_string()));
        Ok(())
    }
}

struct LoopbackExecutorDriver {
    statuses: mpsc::UnboundedSender<TaskStatus>,
}

#[async_trait]
impl berthgrid_core::ExecutorDriver for LoopbackExecutorDriver {
    async fn send_status(&self, status: TaskStatus) -> DriverResult<()> {
        let _ = self.statuses.send(status);
        Ok(())
    }

    async fn send_framework_message(&self, _message: &str) -> DriverResult<()> {
        Ok(())
    }
}

// ── The loop itself ───────────────────────────────────────────────

pub struct DevLoop {
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    control_plane: Arc<DevControlPlane>,
    scheduler_metrics: Arc<SchedulerMetrics>,
    offer_metrics: Arc<OfferMetrics>,
    handles: Vec<JoinHandle<()>>,
}

impl DevLoop {
    pub fn start(config: DevLoopConfig, shutdown: watch::Receiver<bool>) -> Self {
        let scheduler_metrics = Arc::new(SchedulerMetrics::new());
        let offer_metrics = Arc::new(OfferMetrics::new());
        let control_plane = Arc::new(DevControlPlane::default());

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        // Synthetic offers need no decline round-trip.
        let decline: DeclineFn = Arc::new(|offer_id| {
            Box::pin(async move {
                debug!(%offer_id, "declining synthetic offer");
                Ok(())
            })
        });
        let mut registry_config = RegistryConfig::new(decline);
        registry_config.ttl = config.offer_ttl;
        let offers = Arc::new(OfferRegistry::new(registry_config, offer_metrics.clone()));

        let (scheduler, updates) = Scheduler::new(
            SchedulerConfig::default(),
            offers,
            Arc::new(LoopbackSchedulerDriver {
                commands: command_tx,
            }),
            control_plane.clone(),
            Arc::new(FirstFit),
            scheduler_metrics.clone(),
        );

        let agent = DevAgent::new(config.startup_delay, "berthgrid".to_string());
        let executor = Executor::new(
            ExecutorConfig::default(),
            Arc::new(LoopbackExecutorDriver { statuses: status_tx }),
            control_plane.clone(),
            agent.clone(),
            Arc::new(DevRuntime),
            agent_tx,
        );
        executor.registered();

        let mut handles = scheduler.spawn(updates, shutdown.clone());

        // Agent snapshot feed.
        handles.push({
            let agent = agent.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        snapshot = agent_rx.recv() => match snapshot {
                            Some(snapshot) => agent.apply(snapshot),
                            None => break,
                        },
                    }
                }
            })
        });

        // Driver command pump: scheduler → executor.
        handles.push({
            let executor = executor.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let command = tokio::select! {
                        _ = shutdown.changed() => break,
                        command = command_rx.recv() => match command {
                            Some(command) => command,
                            None => break,
                        },
                    };
                    match command {
                        DriverCommand::Launch(tasks) => {
                            for launch in tasks {
                                executor.launch_task(launch);
                            }
                        }
                        DriverCommand::Kill(task_id) => executor.kill_task(&task_id),
                        DriverCommand::Message(message) => executor.framework_message(&message),
                    }
                }
            })
        });

        // Status pump: executor → scheduler.
        handles.push({
            let scheduler = scheduler.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let status = tokio::select! {
                        _ = shutdown.changed() => break,
                        status = status_rx.recv() => match status {
                            Some(status) => status,
                            None => break,
                        },
                    };
                    debug!(task_id = %status.task_id, state = ?status.state, "status update");
                    scheduler.handle_status_update(status).await;
                }
            })
        });

        // Synthetic offer feed.
        handles.push({
            let scheduler = scheduler.clone();
            let node_name = config.node_name.clone();
            let interval = config.offer_interval;
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(interval) => {
                            let offer = OfferDetails {
                                offer_id: format!("offer-{}", Uuid::new_v4()),
                                hostname: node_name.clone(),
                                agent_id: format!("agent-{node_name}"),
                                resources: ResourceVector {
                                    cpus: 8.0,
                                    mem_bytes: 8 << 30,
                                    ports: vec![PortRange { begin: 31000, end: 32000 }],
                                },
                            };
                            scheduler.handle_offers(vec![offer]).await;
                        }
                    }
                }
            })
        });

        info!("standalone development loop started");
        Self {
            scheduler,
            executor,
            control_plane,
            scheduler_metrics,
            offer_metrics,
            handles,
        }
    }

    /// The HTTP surface: pod intake plus the scheduler debug views.
    pub fn router(&self) -> Router {
        let intake = Router::new()
            .route("/api/v1/pods", post(submit_pod).get(list_pods))
            .route("/api/v1/pods/{namespace}/{name}", axum::routing::delete(delete_pod))
            .with_state(IntakeState {
                scheduler: self.scheduler.clone(),
                control_plane: self.control_plane.clone(),
            });
        intake.merge(debug_router(
            self.scheduler.clone(),
            self.scheduler_metrics.clone(),
            self.offer_metrics.clone(),
        ))
    }

    pub async fn stop(self) {
        self.executor.shutdown().await;
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("standalone development loop stopped");
    }
}

#[derive(Clone)]
struct IntakeState {
    scheduler: Arc<Scheduler>,
    control_plane: Arc<DevControlPlane>,
}

/// POST /api/v1/pods — submit a pod for scheduling.
async fn submit_pod(
    State(state): State<IntakeState>,
    Json(mut pod): Json<Pod>,
) -> (StatusCode, String) {
    if pod.uid.is_empty() {
        pod.uid = Uuid::new_v4().to_string();
    }
    let key = pod.key();
    state.control_plane.put_pod(pod.clone());
    state.scheduler.handle_pod_event(PodEvent::Added(pod));
    (StatusCode::CREATED, format!("{key}\n"))
}

/// GET /api/v1/pods — the control plane's pod list.
async fn list_pods(State(state): State<IntakeState>) -> Json<Vec<Pod>> {
    Json(state.control_plane.list())
}

/// DELETE /api/v1/pods/{namespace}/{name}
async fn delete_pod(
    State(state): State<IntakeState>,
    Path((namespace, name)): Path<(String, String)>,
) -> StatusCode {
    let key = berthgrid_core::pod_key(&namespace, &name);
    match state.control_plane.remove_pod(&key) {
        Some(pod) => {
            state.scheduler.handle_pod_event(PodEvent::Deleted(pod));
            StatusCode::OK
        }
        None => {
            warn!(pod = %key, "delete for unknown pod");
            StatusCode::NOT_FOUND
        }
    }
}
