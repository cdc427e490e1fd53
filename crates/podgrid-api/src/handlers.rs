//! REST API handlers.
//!
//! Each handler calls one scheduler operation and returns a JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::warn;

use podgrid_scheduler::SchedulerError;

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

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a scheduler error.
fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::UnknownRequest(_)
        | SchedulerError::NodeNotFound(_)
        | SchedulerError::UnknownWorkloadType(_) => StatusCode::NOT_FOUND,
        SchedulerError::AlreadyTerminal { .. } | SchedulerError::NotAssigned(_) => {
            StatusCode::CONFLICT
        }
        SchedulerError::ProviderCallFailed { .. } => StatusCode::BAD_GATEWAY,
        SchedulerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn scheduler_error(err: SchedulerError) -> axum::response::Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "api request failed");
    }
    error_response(&err.to_string(), status).into_response()
}

// ── Workloads ──────────────────────────────────────────────────

/// POST /api/v1/workloads/{type}
///
/// The body is stored as the request payload.
pub async fn submit_workload(
    State(state): State<ApiState>,
    Path(workload_type): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.scheduler.submit_workload(&workload_type, payload).await {
        Ok(request_id) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "request_id": request_id,
                "workload_type": workload_type,
            })),
        )
            .into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.get_status().await)
}

// ── Requests ───────────────────────────────────────────────────

/// GET /api/v1/requests/{id}
pub async fn get_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.get_request(&id).await {
        Ok(request) => ApiResponse::ok(request).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Completion report body.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: serde_json::Value,
}

/// POST /api/v1/requests/{id}/complete
pub async fn complete_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> impl IntoResponse {
    match state.scheduler.mark_completed(&id, body.result).await {
        Ok(request) => ApiResponse::ok(request).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Failure report body.
#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error: String,
}

/// POST /api/v1/requests/{id}/fail
pub async fn fail_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<FailRequest>,
) -> impl IntoResponse {
    match state.scheduler.mark_failed(&id, &body.error).await {
        Ok(request) => ApiResponse::ok(request).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes/{id}/connection
pub async fn get_node_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.get_node_connection(&id).await {
        Ok(connection) => ApiResponse::ok(connection).into_response(),
        Err(e) => scheduler_error(e),
    }
}
