//! REST API handlers.
//!
//! Task handlers go through the `Dispatcher`; node handlers go through the
//! `NodeRegistry`. Every response uses the `ApiResponse` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use kiln_core::{NodeDescriptor, NodeStatus, TaskRequest};
use kiln_dispatch::DispatchError;
use kiln_registry::RegistryError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn dispatch_error(e: DispatchError) -> Response {
    let status = match &e {
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::DuplicateTask(_)
        | DispatchError::AlreadyTerminal { .. }
        | DispatchError::NotTerminal { .. } => StatusCode::CONFLICT,
        DispatchError::InvalidTask(_) => StatusCode::BAD_REQUEST,
        DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn registry_error(e: RegistryError) -> Response {
    let status = match &e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Tasks ──────────────────────────────────────────────────────

/// POST /api/v1/tasks
pub async fn submit_task(
    State(state): State<ApiState>,
    Json(request): Json<TaskRequest>,
) -> Response {
    match state.dispatcher.submit(request).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "task_id": task_id })),
        )
            .into_response(),
        Err(e) => dispatch_error(e),
    }
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.get_status(&id).await {
        Ok(task) => ApiResponse::ok(task).into_response(),
        Err(e) => dispatch_error(e),
    }
}

/// POST /api/v1/tasks/{id}/cancel
pub async fn cancel_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.cancel(&id).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "task_id": id,
            "state": "cancelled"
        }))
        .into_response(),
        Err(e) => dispatch_error(e),
    }
}

/// GET /api/v1/tasks/{id}/assignments
pub async fn list_assignments(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.dispatcher.assignments(&id).await {
        Ok(rows) => ApiResponse::ok(rows).into_response(),
        Err(e) => dispatch_error(e),
    }
}

/// DELETE /api/v1/tasks/{id}
pub async fn archive_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.archive(&id).await {
        Ok(task) => ApiResponse::ok(task).into_response(),
        Err(e) => dispatch_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// Query filter for the node listing.
#[derive(Debug, Default, Deserialize)]
pub struct NodeFilter {
    pub capability: Option<String>,
    pub status: Option<NodeStatus>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(
    State(state): State<ApiState>,
    Query(filter): Query<NodeFilter>,
) -> Response {
    let nodes = state
        .dispatcher
        .list_nodes(filter.capability.as_deref(), filter.status);
    ApiResponse::ok(nodes).into_response()
}

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(descriptor): Json<NodeDescriptor>,
) -> Response {
    match state.registry.register(descriptor) {
        Ok(node) => {
            if let Some(health) = &state.health {
                health.sync().await;
            }
            info!(node_id = %node.id, address = %node.address, "node registered via API");
            (StatusCode::CREATED, ApiResponse::ok(node)).into_response()
        }
        Err(e) => registry_error(e),
    }
}

/// Maintenance toggle body.
#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

/// PUT /api/v1/nodes/{id}/maintenance
pub async fn set_maintenance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> Response {
    match state.registry.set_maintenance(&id, req.enabled) {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => registry_error(e),
    }
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> Response {
    let nodes = state.registry.snapshot();
    let online = nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Online)
        .count();
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "nodes": nodes.len(),
        "online": online,
    }))
    .into_response()
}
