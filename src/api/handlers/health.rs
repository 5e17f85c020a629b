//! Health endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::api::AppState;

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "service is up"))
)]
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness check: the operation log must be reachable.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "health",
    responses((status = 200), (status = 503))
)]
pub async fn readiness_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let oplog_ok = state.oplog.get(i64::MAX).await.is_err_and(|e| {
        matches!(e, crate::error::AppError::NotFound(_))
    });
    Json(json!({
        "status": if oplog_ok { "ready" } else { "degraded" },
        "instance": state.oplog.instance_id(),
    }))
}
