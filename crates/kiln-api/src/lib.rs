//! kiln-api — REST API for the Kiln dispatcher.
//!
//! Provides axum route handlers for the job queue (submit, status,
//! cancel, archive) and for operators managing the node pool.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/tasks` | Submit a task |
//! | GET | `/api/v1/tasks/{id}` | Task status |
//! | DELETE | `/api/v1/tasks/{id}` | Archive a terminal task |
//! | POST | `/api/v1/tasks/{id}/cancel` | Cancel a task |
//! | GET | `/api/v1/tasks/{id}/assignments` | Attempt history |
//! | GET | `/api/v1/nodes` | List nodes (`?capability=&status=`) |
//! | POST | `/api/v1/nodes` | Register a node |
//! | PUT | `/api/v1/nodes/{id}/maintenance` | Toggle maintenance |
//! | GET | `/healthz` | Coordinator liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use kiln_dispatch::Dispatcher;
use kiln_health::HealthMonitor;
use kiln_registry::NodeRegistry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<NodeRegistry>,
    /// Resynchronised after a node is registered so the new node gets a
    /// probe loop.
    pub health: Option<Arc<HealthMonitor>>,
}

impl ApiState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let registry = Arc::clone(dispatcher.registry());
        Self {
            dispatcher,
            registry,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/tasks", post(handlers::submit_task))
        .route(
            "/tasks/{id}",
            get(handlers::get_task).delete(handlers::archive_task),
        )
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/tasks/{id}/assignments", get(handlers::list_assignments))
        .route(
            "/nodes",
            get(handlers::list_nodes).post(handlers::register_node),
        )
        .route("/nodes/{id}/maintenance", put(handlers::set_maintenance))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state))
}
