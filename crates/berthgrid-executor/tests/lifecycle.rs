//! Executor lifecycle scenarios, end to end against mock collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use berthgrid_core::{
    AgentError, AgentResult, Binding, ClientError, ClientResult, ContainerPort, ContainerRuntime,
    ContainerSpec, ControlPlane, DriverError, DriverResult, ExecutorDriver, FrameworkMessage,
    NodeAgent, Pod, PodPhase, PodSnapshot, PodStatus, RemoteTaskState, ResourceVector, Service,
    TaskLaunch, TaskStatus, BINDING_HOST_KEY,
};
use berthgrid_executor::{messages, Executor, ExecutorConfig};

// ── Mock collaborators ────────────────────────────────────────────

struct MockDriver {
    sent: mpsc::UnboundedSender<TaskStatus>,
    fail_sends: AtomicBool,
    abort: AtomicBool,
}

impl MockDriver {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent: tx,
                fail_sends: AtomicBool::new(false),
                abort: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ExecutorDriver for MockDriver {
    async fn send_status(&self, status: TaskStatus) -> DriverResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(DriverError::Aborted);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DriverError::Call("send failed".to_string()));
        }
        let _ = self.sent.send(status);
        Ok(())
    }

    async fn send_framework_message(&self, _message: &str) -> DriverResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockAgent {
    pods: Mutex<HashMap<String, PodStatus>>,
}

impl MockAgent {
    fn set_phase(&self, full_name: &str, phase: PodPhase) {
        self.pods.lock().unwrap().insert(
            full_name.to_string(),
            PodStatus {
                host: "node-1".to_string(),
                phase,
                message: String::new(),
            },
        );
    }

    fn forget(&self, full_name: &str) {
        self.pods.lock().unwrap().remove(full_name);
    }
}

#[async_trait]
impl NodeAgent for MockAgent {
    async fn pod_status(&self, pod_full_name: &str) -> AgentResult<PodStatus> {
        self.pods
            .lock()
            .unwrap()
            .get(pod_full_name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownPod(pod_full_name.to_string()))
    }
}

#[derive(Default)]
struct MockControlPlane {
    bindings: Mutex<Vec<Binding>>,
    fail_bindings: AtomicBool,
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn post_binding(&self, binding: &Binding) -> ClientResult<()> {
        if self.fail_bindings.load(Ordering::SeqCst) {
            return Err(ClientError::Status(500));
        }
        self.bindings.lock().unwrap().push(binding.clone());
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> ClientResult<Option<Pod>> {
        Ok(None)
    }

    async fn list_pods(&self) -> ClientResult<Vec<Pod>> {
        Ok(Vec::new())
    }

    async fn list_services(&self, _namespace: &str) -> ClientResult<Vec<Service>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct MockRuntime {
    removals: Mutex<u32>,
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn remove_managed_containers(&self) -> AgentResult<u32> {
        let mut removals = self.removals.lock().unwrap();
        *removals += 1;
        Ok(2)
    }
}

// ── Fixture ───────────────────────────────────────────────────────

struct Fixture {
    executor: Arc<Executor>,
    statuses: mpsc::UnboundedReceiver<TaskStatus>,
    updates: mpsc::UnboundedReceiver<PodSnapshot>,
    driver: Arc<MockDriver>,
    agent: Arc<MockAgent>,
    control_plane: Arc<MockControlPlane>,
    runtime: Arc<MockRuntime>,
}

fn fixture() -> Fixture {
    let (driver, statuses) = MockDriver::new();
    let agent = Arc::new(MockAgent::default());
    let control_plane = Arc::new(MockControlPlane::default());
    let runtime = Arc::new(MockRuntime::default());
    let (updates_tx, updates) = mpsc::unbounded_channel();
    let config = ExecutorConfig {
        container_poll_interval: Duration::from_millis(10),
        launch_grace_period: Duration::from_millis(500),
        ..ExecutorConfig::default()
    };
    let executor = Executor::new(
        config,
        driver.clone(),
        control_plane.clone(),
        agent.clone(),
        runtime.clone(),
        updates_tx,
    );
    Fixture {
        executor,
        statuses,
        updates,
        driver,
        agent,
        control_plane,
        runtime,
    }
}

fn bound_pod(name: &str, host: &str) -> Pod {
    let mut annotations = HashMap::new();
    annotations.insert(BINDING_HOST_KEY.to_string(), host.to_string());
    Pod {
        namespace: "default".to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        annotations,
        labels: HashMap::new(),
        containers: vec![ContainerSpec {
            name: "main".to_string(),
            image: "registry/app:1".to_string(),
            ports: vec![ContainerPort {
                container_port: 8080,
                host_port: 31500,
            }],
            env: Vec::new(),
            resources: Default::default(),
        }],
        status: PodStatus::default(),
    }
}

fn launch_for(task_id: &str, pod: &Pod) -> TaskLaunch {
    TaskLaunch {
        task_id: task_id.to_string(),
        name: pod.key(),
        agent_id: "agent-node-1".to_string(),
        resources: ResourceVector::default(),
        data: serde_json::to_vec(pod).unwrap(),
    }
}

fn full_name(pod: &Pod) -> String {
    berthgrid_core::pod_full_name(&pod.name, &pod.namespace, "berthgrid")
}

async fn next_status(rx: &mut mpsc::UnboundedReceiver<TaskStatus>) -> TaskStatus {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for status update")
        .expect("status channel closed")
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn launch_reports_starting_then_running() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));

    let starting = next_status(&mut f.statuses).await;
    assert_eq!(starting.state, RemoteTaskState::Starting);
    assert_eq!(starting.message, messages::CREATE_BINDING_SUCCESS);
    assert!(!starting.data.is_empty());

    // Binding hit the control plane with the scheduler's annotations.
    {
        let bindings = f.control_plane.bindings.lock().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].pod_name, "api");
        assert_eq!(bindings[0].host, "node-1");
        assert!(bindings[0].annotations.contains_key(BINDING_HOST_KEY));
    }

    // The agent got the pod set.
    let snapshot = f.updates.recv().await.unwrap();
    assert_eq!(snapshot.pods.len(), 1);

    // Agent observes the pod running on a later poll.
    f.agent.set_phase(&full_name(&pod), PodPhase::Running);
    let running = next_status(&mut f.statuses).await;
    assert_eq!(running.state, RemoteTaskState::Running);
    assert!(running.message.starts_with("pod-running:"));
    assert!(!running.data.is_empty());
    assert!(f.executor.has_task("t1"));
}

#[tokio::test]
async fn duplicate_launch_is_silently_ignored() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    let _ = next_status(&mut f.statuses).await; // STARTING

    f.executor.launch_task(launch_for("t1", &pod));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One binding, no extra statuses.
    assert_eq!(f.control_plane.bindings.lock().unwrap().len(), 1);
    assert!(f.statuses.try_recv().is_err());
    assert_eq!(f.executor.task_count(), 1);
}

#[tokio::test]
async fn undecodable_payload_fails_task() {
    let mut f = fixture();
    f.executor.registered();

    let launch = TaskLaunch {
        task_id: "t1".to_string(),
        name: "default/api".to_string(),
        agent_id: "agent-node-1".to_string(),
        resources: ResourceVector::default(),
        data: b"not json".to_vec(),
    };
    f.executor.launch_task(launch);

    let failed = next_status(&mut f.statuses).await;
    assert_eq!(failed.state, RemoteTaskState::Failed);
    assert_eq!(failed.message, messages::UNMARSHAL_TASK_DATA_FAILURE);
    assert_eq!(f.executor.task_count(), 0);
}

#[tokio::test]
async fn launch_while_disconnected_fails_task() {
    let mut f = fixture();
    // Never registered: still disconnected. The pump won't drain, so
    // inspect the outbox indirectly by reconnecting afterwards.
    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    f.executor.registered();

    let failed = next_status(&mut f.statuses).await;
    assert_eq!(failed.state, RemoteTaskState::Failed);
    assert_eq!(failed.message, messages::EXECUTOR_UNREGISTERED);
    assert!(f.control_plane.bindings.lock().unwrap().is_empty());
}

#[tokio::test]
async fn binding_failure_fails_task() {
    let mut f = fixture();
    f.executor.registered();
    f.control_plane.fail_bindings.store(true, Ordering::SeqCst);

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));

    let failed = next_status(&mut f.statuses).await;
    assert_eq!(failed.state, RemoteTaskState::Failed);
    assert_eq!(failed.message, messages::CREATE_BINDING_FAILURE);
}

#[tokio::test]
async fn launch_grace_expiry_reports_exactly_one_lost() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    // Agent never reports the pod running.
    f.executor.launch_task(launch_for("t1", &pod));

    let starting = next_status(&mut f.statuses).await;
    assert_eq!(starting.state, RemoteTaskState::Starting);

    let lost = next_status(&mut f.statuses).await;
    assert_eq!(lost.state, RemoteTaskState::Lost);
    assert_eq!(lost.message, messages::LAUNCH_TASK_FAILED);

    // Exactly one LOST; nothing else follows.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.statuses.try_recv().is_err());
    assert_eq!(f.executor.task_count(), 0);
}

#[tokio::test]
async fn kill_task_removes_pod_and_reports_killed() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    let _ = next_status(&mut f.statuses).await; // STARTING
    f.agent.set_phase(&full_name(&pod), PodPhase::Running);
    let _ = next_status(&mut f.statuses).await; // RUNNING
    let _ = f.updates.recv().await; // pod handed to agent

    f.executor.kill_task("t1");

    let killed = next_status(&mut f.statuses).await;
    assert_eq!(killed.state, RemoteTaskState::Killed);
    assert_eq!(killed.message, messages::TASK_KILLED);

    // The agent got an empty pod set.
    let snapshot = f.updates.recv().await.unwrap();
    assert!(snapshot.pods.is_empty());
    assert_eq!(f.executor.task_count(), 0);
}

#[tokio::test]
async fn kill_while_disconnected_is_ignored() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    let _ = next_status(&mut f.statuses).await; // STARTING
    f.agent.set_phase(&full_name(&pod), PodPhase::Running);
    let _ = next_status(&mut f.statuses).await; // RUNNING

    f.executor.disconnected();
    f.executor.kill_task("t1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.executor.has_task("t1"));
}

#[tokio::test]
async fn lost_pod_reports_containers_disappeared() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    let _ = next_status(&mut f.statuses).await; // STARTING
    f.agent.set_phase(&full_name(&pod), PodPhase::Running);
    let _ = next_status(&mut f.statuses).await; // RUNNING

    // The pod disappears from the agent while the task is registered.
    f.agent.forget(&full_name(&pod));

    let lost = next_status(&mut f.statuses).await;
    assert_eq!(lost.state, RemoteTaskState::Lost);
    assert_eq!(lost.message, messages::CONTAINERS_DISAPPEARED);
    assert_eq!(f.executor.task_count(), 0);
}

#[tokio::test]
async fn status_pump_pauses_while_disconnected_and_resumes() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    let _ = next_status(&mut f.statuses).await; // STARTING
    f.agent.set_phase(&full_name(&pod), PodPhase::Running);
    let _ = next_status(&mut f.statuses).await; // RUNNING

    f.executor.disconnected();
    // A status produced while disconnected stays queued.
    f.executor.send_status(TaskStatus::new(
        "t1",
        RemoteTaskState::Running,
        "heartbeat",
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.statuses.try_recv().is_err());
    // The task survived the disconnect.
    assert!(f.executor.has_task("t1"));

    f.executor.reregistered();
    let resumed = next_status(&mut f.statuses).await;
    assert_eq!(resumed.message, "heartbeat");
}

#[tokio::test]
async fn failed_send_requeues_same_status() {
    let mut f = fixture();
    f.executor.registered();
    f.driver.fail_sends.store(true, Ordering::SeqCst);

    f.executor.send_status(TaskStatus::new(
        "t1",
        RemoteTaskState::Running,
        "flaky",
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.statuses.try_recv().is_err());

    // Once the driver recovers, the same update goes out.
    f.driver.fail_sends.store(false, Ordering::SeqCst);
    let delivered = next_status(&mut f.statuses).await;
    assert_eq!(delivered.message, "flaky");
}

#[tokio::test]
async fn framework_task_lost_message_cleans_up() {
    let mut f = fixture();
    f.executor.registered();

    let pod = bound_pod("api", "node-1");
    f.executor.launch_task(launch_for("t1", &pod));
    let _ = next_status(&mut f.statuses).await; // STARTING
    f.agent.set_phase(&full_name(&pod), PodPhase::Running);
    let _ = next_status(&mut f.statuses).await; // RUNNING

    f.executor
        .framework_message(&FrameworkMessage::TaskLost {
            task_id: "t1".to_string(),
        }
        .encode());

    let lost = next_status(&mut f.statuses).await;
    assert_eq!(lost.state, RemoteTaskState::Lost);
    assert_eq!(lost.message, messages::TASK_LOST_ACK);
    assert_eq!(f.executor.task_count(), 0);
}

#[tokio::test]
async fn shutdown_clears_tasks_and_sweeps_containers() {
    let mut f = fixture();
    f.executor.registered();

    for (task_id, name) in [("t1", "api"), ("t2", "worker")] {
        let pod = bound_pod(name, "node-1");
        f.executor.launch_task(launch_for(task_id, &pod));
        let _ = next_status(&mut f.statuses).await; // STARTING
        f.agent.set_phase(&full_name(&pod), PodPhase::Running);
        let _ = next_status(&mut f.statuses).await; // RUNNING
    }
    assert_eq!(f.executor.task_count(), 2);

    f.executor.shutdown().await;

    assert!(f.executor.is_done());
    assert_eq!(f.executor.task_count(), 0);
    // The last snapshot hands the agent an empty pod set.
    let mut last = None;
    while let Ok(snapshot) = f.updates.try_recv() {
        last = Some(snapshot);
    }
    assert!(last.unwrap().pods.is_empty());
    // Managed containers were force-removed.
    assert_eq!(*f.runtime.removals.lock().unwrap(), 1);

    // Further callbacks are no-ops; the resource manager generates
    // TASK_LOST for the scheduler side on its own.
    f.executor.kill_task("t1");
    assert!(f.statuses.try_recv().is_err());
}

#[tokio::test]
#[should_panic(expected = "already connected")]
async fn double_register_is_a_programming_error() {
    let f = fixture();
    f.executor.registered();
    f.executor.registered();
}
