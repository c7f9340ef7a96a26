//! Debug and metrics HTTP endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;

use berthgrid_metrics::{render_prometheus, OfferMetrics, SchedulerMetrics};

use crate::scheduler::Scheduler;

#[derive(Clone)]
struct DebugState {
    scheduler: Arc<Scheduler>,
    scheduler_metrics: Arc<SchedulerMetrics>,
    offer_metrics: Arc<OfferMetrics>,
}

/// Router exposing the scheduler's debug views and the Prometheus
/// metrics endpoint.
pub fn debug_router(
    scheduler: Arc<Scheduler>,
    scheduler_metrics: Arc<SchedulerMetrics>,
    offer_metrics: Arc<OfferMetrics>,
) -> Router {
    Router::new()
        .route("/debug/scheduler/podqueue", get(pod_queue))
        .route("/debug/scheduler/podstore", get(pod_store))
        .route("/debug/scheduler/tasks", get(tasks))
        .route("/metrics", get(metrics))
        .with_state(DebugState {
            scheduler,
            scheduler_metrics,
            offer_metrics,
        })
}

/// GET /debug/scheduler/podqueue — pods awaiting scheduling.
async fn pod_queue(State(state): State<DebugState>) -> String {
    let mut out = String::new();
    for entry in state.scheduler.queuer().pod_queue.list() {
        out.push_str(&format!(
            "{} uid={} due_in={:?}\n",
            entry.pod.key(),
            entry.pod.uid,
            entry
                .deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default(),
        ));
    }
    out
}

/// GET /debug/scheduler/podstore — the mirrored pod collection.
async fn pod_store(State(state): State<DebugState>) -> String {
    let mut out = String::new();
    for pod in state.scheduler.queuer().pod_updates.list() {
        out.push_str(&format!(
            "{} uid={} host={:?} phase={:?}\n",
            pod.key(),
            pod.uid,
            pod.status.host,
            pod.status.phase,
        ));
    }
    out
}

/// GET /debug/scheduler/tasks — the pod-task bimap.
async fn tasks(State(state): State<DebugState>) -> String {
    let mut out = String::new();
    for (task_id, pod_key, task_state) in state.scheduler.tasks_snapshot().await {
        out.push_str(&format!("{task_id} pod={pod_key} state={task_state:?}\n"));
    }
    out
}

/// GET /metrics — Prometheus text exposition.
async fn metrics(State(state): State<DebugState>) -> String {
    render_prometheus(&state.scheduler_metrics, &state.offer_metrics)
}
