//! podgrid-api — REST API for podgrid.
//!
//! Thin axum routes over the scheduler's inbound operations. Workflow
//! executors use them to submit work, fetch node endpoints and report
//! results.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/workloads/{type}` | Submit a workload (body is the payload) |
//! | GET | `/api/v1/status` | Nodes, pending queues, loop state |
//! | GET | `/api/v1/requests/{id}` | Request status and result |
//! | POST | `/api/v1/requests/{id}/complete` | Report a result |
//! | POST | `/api/v1/requests/{id}/fail` | Report a failure |
//! | GET | `/api/v1/nodes/{id}/connection` | Node address, port, readiness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use podgrid_scheduler::Scheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
}

/// Build the API router.
pub fn build_router(scheduler: Scheduler) -> Router {
    let api_state = ApiState { scheduler };

    let api_routes = Router::new()
        .route("/workloads/{workload_type}", post(handlers::submit_workload))
        .route("/status", get(handlers::get_status))
        .route("/requests/{id}", get(handlers::get_request))
        .route("/requests/{id}/complete", post(handlers::complete_request))
        .route("/requests/{id}/fail", post(handlers::fail_request))
        .route("/nodes/{id}/connection", get(handlers::get_node_connection))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
