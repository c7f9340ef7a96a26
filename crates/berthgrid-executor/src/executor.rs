//! The agent-side executor: receives task launches, instantiates pods
//! on the local node agent, watches their liveness, and reports
//! terminal transitions back through the driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use berthgrid_core::{
    pod_full_name, Binding, ContainerRuntime, ControlPlane, DriverError, ExecutorDriver,
    FrameworkMessage, NodeAgent, Pod, PodPhase, PodSnapshot, PodStatusResult, RemoteTaskState,
    TaskLaunch, TaskStatus, BINDING_HOST_KEY,
};

use crate::config::ExecutorConfig;
use crate::messages;

const DISCONNECTED: u8 = 0;
const CONNECTED: u8 = 1;
const DONE: u8 = 2;

struct ExecutorTask {
    launch: TaskLaunch,
    /// Set once the pod has been handed to the agent; while `None`
    /// there is nothing to clean up on removal.
    pod_full_name: Option<String>,
}

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, ExecutorTask>,
    pods: HashMap<String, Pod>,
}

impl Tables {
    fn snapshot(&self) -> PodSnapshot {
        PodSnapshot::set(self.pods.values().cloned().collect())
    }
}

/// The executor: a task table, a pod table, and a single-writer status
/// pump toward the driver.
pub struct Executor {
    config: ExecutorConfig,
    state: AtomicU8,
    tables: Mutex<Tables>,
    updates: mpsc::UnboundedSender<PodSnapshot>,
    driver: Arc<dyn ExecutorDriver>,
    client: Arc<dyn ControlPlane>,
    agent: Arc<dyn NodeAgent>,
    runtime: Arc<dyn ContainerRuntime>,
    outgoing: mpsc::Sender<TaskStatus>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Executor {
    /// Build the executor and start its status send loop. Pod set
    /// replacements flow to the node agent over `updates`.
    pub fn new(
        config: ExecutorConfig,
        driver: Arc<dyn ExecutorDriver>,
        client: Arc<dyn ControlPlane>,
        agent: Arc<dyn NodeAgent>,
        runtime: Arc<dyn ContainerRuntime>,
        updates: mpsc::UnboundedSender<PodSnapshot>,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outbox_capacity);
        let (done_tx, done_rx) = watch::channel(false);
        let executor = Arc::new(Self {
            config,
            state: AtomicU8::new(DISCONNECTED),
            tables: Mutex::new(Tables::default()),
            updates,
            driver,
            client,
            agent,
            runtime,
            outgoing: outgoing_tx,
            done_tx,
            done_rx,
        });
        tokio::spawn(executor.clone().run_send_loop(outgoing_rx));
        executor
    }

    fn get_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn swap_state(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.get_state() == CONNECTED
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Driver callback: registered with the agent.
    pub fn registered(&self) {
        if self.is_done() {
            return;
        }
        info!("executor registered");
        if !self.swap_state(DISCONNECTED, CONNECTED) {
            // programming error
            panic!("already connected");
        }
    }

    /// Driver callback: re-registered after an agent failover.
    pub fn reregistered(&self) {
        if self.is_done() {
            return;
        }
        info!("executor re-registered");
        if !self.swap_state(DISCONNECTED, CONNECTED) {
            // programming error
            panic!("already connected");
        }
    }

    /// Driver callback: connection to the agent lost.
    pub fn disconnected(&self) {
        if self.is_done() {
            return;
        }
        warn!("agent disconnected");
        if !self.swap_state(CONNECTED, DISCONNECTED) {
            // programming error
            panic!("already disconnected");
        }
    }

    /// Driver callback: launch a task carrying a bound-pod payload.
    pub fn launch_task(self: &Arc<Self>, launch: TaskLaunch) {
        if self.is_done() {
            return;
        }
        info!(task_id = %launch.task_id, "launch task");

        if !self.is_connected() {
            warn!("ignoring launch task, executor is disconnected");
            self.send_status(TaskStatus::new(
                &launch.task_id,
                RemoteTaskState::Failed,
                messages::EXECUTOR_UNREGISTERED,
            ));
            return;
        }

        let pod: Pod = match serde_json::from_slice(&launch.data) {
            Ok(pod) => pod,
            Err(err) => {
                warn!(error = %err, "failed to decode bound pod from task data");
                self.send_status(TaskStatus::new(
                    &launch.task_id,
                    RemoteTaskState::Failed,
                    messages::UNMARSHAL_TASK_DATA_FAILURE,
                ));
                return;
            }
        };

        let task_id = launch.task_id.clone();
        {
            let mut tables = self.tables.lock().unwrap();
            if tables.tasks.contains_key(&task_id) {
                // Duplicate message or duplicate task id; no second
                // status update, no second binding.
                warn!(%task_id, "task already launched");
                return;
            }
            tables.tasks.insert(
                task_id.clone(),
                ExecutorTask {
                    launch,
                    pod_full_name: None,
                },
            );
        }

        let executor = self.clone();
        tokio::spawn(async move { executor.run_launch(task_id, pod).await });
    }

    /// Phase 1 — post the binding, hand the pod to the agent, report
    /// STARTING, then wait for the agent to see it running.
    async fn run_launch(self: Arc<Self>, task_id: String, pod: Pod) {
        let binding = Binding {
            namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            host: pod
                .annotations
                .get(BINDING_HOST_KEY)
                .cloned()
                .unwrap_or_default(),
            annotations: pod.annotations.clone(),
        };
        info!(pod = %binding.pod_name, host = %binding.host, "posting binding");
        if let Err(err) = self.client.post_binding(&binding).await {
            warn!(%task_id, error = %err, "failed to create binding");
            self.send_status(TaskStatus::new(
                &task_id,
                RemoteTaskState::Failed,
                messages::CREATE_BINDING_FAILURE,
            ));
            return;
        }

        let full_name = pod_full_name(&pod.name, &pod.namespace, &self.config.source_name);

        // An empty status payload: lets a recovered scheduler observe
        // the task→pod mapping before the pod is up.
        let starting_payload = PodStatusResult {
            name: full_name.clone(),
            status: Default::default(),
        };
        let data = match serde_json::to_vec(&starting_payload) {
            Ok(data) => data,
            Err(err) => {
                error!(%task_id, error = %err, "failed to marshal pod status result");
                self.send_status(TaskStatus::new(
                    &task_id,
                    RemoteTaskState::Failed,
                    &err.to_string(),
                ));
                return;
            }
        };

        {
            let mut tables = self.tables.lock().unwrap();
            let Some(task) = tables.tasks.get_mut(&task_id) else {
                debug!(%task_id, "task no longer on record, aborting launch sequence");
                drop(tables);
                self.report_lost(&task_id, messages::LAUNCH_TASK_FAILED);
                return;
            };
            task.pod_full_name = Some(full_name.clone());
            tables.pods.insert(full_name.clone(), pod);
            let snapshot = tables.snapshot();
            let _ = self.updates.send(snapshot);
        }

        self.send_status(
            TaskStatus::new(
                &task_id,
                RemoteTaskState::Starting,
                messages::CREATE_BINDING_SUCCESS,
            )
            .with_data(data),
        );

        self.await_running(task_id, full_name).await;
    }

    /// Phase 2 — poll the agent until the pod reports Running, then
    /// report RUNNING and hand off to the liveness monitor. Gives up
    /// after the launch grace period.
    async fn await_running(self: Arc<Self>, task_id: String, full_name: String) {
        let expiry = Instant::now() + self.config.launch_grace_period;
        loop {
            tokio::time::sleep(self.config.container_poll_interval).await;
            if Instant::now() >= expiry {
                warn!(%task_id, grace = ?self.config.launch_grace_period, "launch grace period expired");
                break;
            }
            if self.is_done() {
                return;
            }

            let status = match self.agent.pod_status(&full_name).await {
                Ok(status) => status,
                Err(_) => continue,
            };
            if status.phase != PodPhase::Running {
                // Not up yet; keep polling.
                continue;
            }

            {
                let tables = self.tables.lock().unwrap();
                if !tables.tasks.contains_key(&task_id) {
                    break;
                }
            }
            let payload = PodStatusResult {
                name: full_name.clone(),
                status,
            };
            let data = serde_json::to_vec(&payload).unwrap_or_default();
            debug!(%task_id, pod = %full_name, "pod running");
            self.send_status(
                TaskStatus::new(
                    &task_id,
                    RemoteTaskState::Running,
                    &format!("pod-running:{full_name}"),
                )
                .with_data(data),
            );

            let executor = self.clone();
            tokio::spawn(async move { executor.run_monitor(task_id, full_name).await });
            return;
        }

        self.report_lost(&task_id, messages::LAUNCH_TASK_FAILED);
    }

    /// Phase 3 — liveness: once the agent stops reporting the pod while
    /// the task is still registered, the task is lost.
    async fn run_monitor(self: Arc<Self>, task_id: String, full_name: String) {
        loop {
            tokio::time::sleep(self.config.container_poll_interval).await;
            if self.is_done() {
                return;
            }
            {
                let tables = self.tables.lock().unwrap();
                if !tables.tasks.contains_key(&task_id) {
                    debug!(%task_id, "task no longer registered, stopping pod monitor");
                    return;
                }
            }
            if self.agent.pod_status(&full_name).await.is_err() {
                warn!(%task_id, pod = %full_name, "detected lost pod");
                self.report_lost(&task_id, messages::CONTAINERS_DISAPPEARED);
                return;
            }
        }
    }

    /// Driver callback: kill a task. Silently ignored while
    /// disconnected; the resource manager will reconcile.
    pub fn kill_task(&self, task_id: &str) {
        if self.is_done() {
            return;
        }
        info!(%task_id, "kill task");
        if !self.is_connected() {
            warn!("ignoring kill task, executor is disconnected");
            return;
        }
        self.remove_pod_task(task_id, messages::TASK_KILLED, RemoteTaskState::Killed);
    }

    /// Driver callback: an out-of-band message from the scheduler.
    pub fn framework_message(&self, message: &str) {
        if self.is_done() {
            return;
        }
        if !self.is_connected() {
            warn!("ignoring framework message, executor is disconnected");
            return;
        }
        match FrameworkMessage::parse(message) {
            FrameworkMessage::TaskLost { task_id } => {
                // The resource manager told the scheduler first; clean
                // up our side and acknowledge.
                self.report_lost(&task_id, messages::TASK_LOST_ACK);
            }
            FrameworkMessage::Other(raw) => {
                debug!(message = %raw, "ignoring framework message");
            }
        }
    }

    /// Driver callback: shut down. Clears the task table, hands the
    /// agent an empty pod set, and force-removes managed containers.
    pub async fn shutdown(&self) {
        if self.is_done() {
            return;
        }
        info!("shutting down executor");
        let _ = self.done_tx.send(true);

        {
            let mut tables = self.tables.lock().unwrap();
            tables.tasks.clear();
            // Stop the agent from respawning anything while we exit.
            let _ = self.updates.send(PodSnapshot::set(Vec::new()));
        }

        match self.runtime.remove_managed_containers().await {
            Ok(removed) => info!(removed, "removed managed containers"),
            Err(err) => warn!(error = %err, "failed to remove managed containers"),
        }

        while !self.swap_state(self.get_state(), DONE) {}
    }

    fn report_lost(&self, task_id: &str, reason: &str) {
        self.remove_pod_task(task_id, reason, RemoteTaskState::Lost);
    }

    /// Remove a task and its pod, push the shrunken pod set to the
    /// agent, and emit the terminal status.
    fn remove_pod_task(&self, task_id: &str, reason: &str, state: RemoteTaskState) {
        {
            let mut tables = self.tables.lock().unwrap();
            let Some(task) = tables.tasks.remove(task_id) else {
                debug!(%task_id, "failed to remove task, unknown task");
                return;
            };
            if let Some(full_name) = task.pod_full_name {
                if tables.pods.remove(&full_name).is_some() {
                    debug!(pod = %full_name, %task_id, "deleting pod for task");
                    let snapshot = tables.snapshot();
                    let _ = self.updates.send(snapshot);
                } else {
                    warn!(pod = %full_name, %task_id, "cannot remove unknown pod for task");
                }
            }
        }
        self.send_status(TaskStatus::new(task_id, state, reason));
    }

    /// Enqueue a status update for the send pump. Non-blocking; drops
    /// on shutdown, warns when the outbox is saturated.
    pub fn send_status(&self, status: TaskStatus) {
        if self.is_done() {
            return;
        }
        if let Err(err) = self.outgoing.try_send(status) {
            warn!(error = %err, "dropping status update, outbox unavailable");
        }
    }

    /// The single-writer status pump: drains the outbox while
    /// connected, re-enqueues on transient failure, exits when the
    /// driver aborts.
    async fn run_send_loop(self: Arc<Self>, mut outgoing: mpsc::Receiver<TaskStatus>) {
        let mut done = self.done_rx.clone();
        loop {
            if self.is_done() {
                break;
            }
            if !self.is_connected() {
                tokio::select! {
                    _ = done.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
            let status = tokio::select! {
                _ = done.changed() => break,
                status = outgoing.recv() => match status {
                    Some(status) => status,
                    None => break,
                },
            };
            if !self.is_connected() {
                // Disconnected between the gate and the recv; keep the
                // update queued until we reconnect.
                tokio::select! {
                    _ = done.changed() => break,
                    _ = self.outgoing.send(status) => {}
                }
                continue;
            }
            match self.driver.send_status(status.clone()).await {
                Ok(()) => {}
                Err(DriverError::Aborted) => {
                    error!("driver aborted, stopping status pump");
                    break;
                }
                Err(err) => {
                    error!(error = %err, task_id = %status.task_id, "failed to send status update, requeuing");
                    tokio::select! {
                        _ = done.changed() => break,
                        _ = self.outgoing.send(status) => {}
                    }
                }
            }
        }
        debug!("status pump exiting");
    }

    /// Number of tasks currently on record.
    pub fn task_count(&self) -> usize {
        self.tables.lock().unwrap().tasks.len()
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.tables.lock().unwrap().tasks.contains_key(task_id)
    }

    /// Pod full names currently handed to the agent.
    pub fn pod_names(&self) -> Vec<String> {
        self.tables.lock().unwrap().pods.keys().cloned().collect()
    }
}
