//! REST API handlers for the node pool and the scheduler queue.
//!
//! Nodes register and heartbeat here to become discoverable engine
//! hosts. Queue routes drive the substitution protocol the way a
//! scheduler would: a task entering the queue is a wait event, a task
//! removed from it is a leave event.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use dockyard_queue::{QueueItem, QueuedTask, SubstitutionRecord, TaskQueue};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

// ── Nodes ──────────────────────────────────────────────────────

/// Request body for POST /api/v1/nodes.
#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.nodes.list())
}

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return error_response("node name must not be empty", StatusCode::BAD_REQUEST)
            .into_response();
    }
    state.nodes.register(&req.name, req.address, req.labels);
    info!(node = %req.name, "node registered");
    (StatusCode::CREATED, ApiResponse::ok(req.name)).into_response()
}

/// POST /api/v1/nodes/:name/heartbeat
pub async fn node_heartbeat(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.nodes.heartbeat(&name) {
        ApiResponse::ok(name).into_response()
    } else {
        error_response("node not found", StatusCode::NOT_FOUND).into_response()
    }
}

/// DELETE /api/v1/nodes/:name
pub async fn remove_node(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.nodes.leave(&name) {
        info!(node = %name, "node left");
        ApiResponse::ok(name).into_response()
    } else {
        error_response("node not found", StatusCode::NOT_FOUND).into_response()
    }
}

// ── Queue ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct QueueItemView {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct QueueView {
    pub items: Vec<QueueItemView>,
    pub substitutions: Vec<SubstitutionRecord>,
}

/// GET /api/v1/queue
pub async fn queue_status(State(state): State<ApiState>) -> impl IntoResponse {
    let items = state
        .queue
        .items()
        .iter()
        .map(|item| QueueItemView {
            id: item.id().to_string(),
            name: item.display_name(),
            kind: match item {
                QueueItem::Task(_) => "task",
                QueueItem::HostProvisioning(_) => "host-provisioning",
            },
        })
        .collect();
    ApiResponse::ok(QueueView {
        items,
        substitutions: state.substitution.records(),
    })
}

/// POST /api/v1/queue/tasks
pub async fn enqueue_task(
    State(state): State<ApiState>,
    Json(task): Json<QueuedTask>,
) -> impl IntoResponse {
    state.queue.schedule(QueueItem::Task(task.clone()));
    match state.substitution.on_enter_waiting(&task) {
        Ok(outcome) => (StatusCode::ACCEPTED, ApiResponse::ok(outcome)).into_response(),
        // The task stays queued; only the substitution was refused.
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    }
}

/// DELETE /api/v1/queue/tasks/:id
pub async fn task_left(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let removed = state.queue.cancel(&id);
    state.substitution.on_left(&id);
    if removed {
        ApiResponse::ok(id).into_response()
    } else {
        error_response("task not queued", StatusCode::NOT_FOUND).into_response()
    }
}
