//! Operation log endpoints: query, cancel, clear history, transcripts.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::api::dto::{
    truncate_for_display, ClearHistoryRequest, ClearHistoryResponse, DownloadUrlResponse,
    GetOperationsRequest, OperationList, LOG_DISPLAY_LIMIT,
};
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::operation::{Operation, OperationStatus};

/// Query operations with a selector, newest-first capped by `last_n` when
/// given, ascending id order otherwise.
#[utoipa::path(
    post,
    path = "/operations/query",
    context_path = "/api/v1",
    tag = "operations",
    request_body = GetOperationsRequest,
    responses((status = 200, body = OperationList))
)]
pub async fn get_operations(
    State(state): State<AppState>,
    Json(request): Json<GetOperationsRequest>,
) -> Result<Json<OperationList>> {
    let selector = request.selector.into_selector();
    let operations = match request.last_n {
        Some(n) => state.oplog.query_last(&selector, n).await?,
        None => state.oplog.query(&selector).await?,
    };
    Ok(Json(OperationList { operations }))
}

/// Fetch one operation by id.
#[utoipa::path(
    get,
    path = "/operations/{id}",
    context_path = "/api/v1",
    tag = "operations",
    params(("id" = i64, Path, description = "operation id")),
    responses((status = 200, body = Operation), (status = 404))
)]
pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Operation>> {
    Ok(Json(state.oplog.get(id).await?))
}

/// Cancel the task owning an operation. The task gets a grace period to
/// finalize; if it misses it the operation is rewritten to
/// SYSTEM_CANCELLED.
#[utoipa::path(
    post,
    path = "/operations/{id}/cancel",
    context_path = "/api/v1",
    tag = "operations",
    params(("id" = i64, Path, description = "operation id")),
    responses((status = 200), (status = 404))
)]
pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.orchestrator.cancel_operation(id).await?;
    Ok(Json(serde_json::json!({ "cancelled": id })))
}

/// Delete operation history. Running operations are never cleared; with
/// `only_failed` the deletion is limited to error and cancelled outcomes.
#[utoipa::path(
    post,
    path = "/operations/clear",
    context_path = "/api/v1",
    tag = "operations",
    request_body = ClearHistoryRequest,
    responses((status = 200, body = ClearHistoryResponse))
)]
pub async fn clear_history(
    State(state): State<AppState>,
    Json(request): Json<ClearHistoryRequest>,
) -> Result<Json<ClearHistoryResponse>> {
    let mut selector = request.selector.into_selector();
    let allowed: Vec<OperationStatus> = if request.only_failed {
        vec![
            OperationStatus::Error,
            OperationStatus::UserCancelled,
            OperationStatus::SystemCancelled,
        ]
    } else {
        vec![
            OperationStatus::Success,
            OperationStatus::Error,
            OperationStatus::Warning,
            OperationStatus::UserCancelled,
            OperationStatus::SystemCancelled,
        ]
    };
    selector.statuses = Some(match selector.statuses.take() {
        Some(requested) => requested
            .into_iter()
            .filter(|s| allowed.contains(s))
            .collect(),
        None => allowed,
    });

    let deleted = state.oplog.delete(&selector).await?;
    Ok(Json(ClearHistoryResponse { deleted }))
}

#[derive(Debug, Default, Deserialize)]
pub struct GetLogsQuery {
    /// Skip display truncation and stream the faithful transcript.
    #[serde(default)]
    pub full: bool,
}

/// Fetch the transcript behind an operation's logref. Display truncation
/// (first 16 KB + last 16 KB) is applied here, never in the store.
#[utoipa::path(
    get,
    path = "/operations/{id}/logs",
    context_path = "/api/v1",
    tag = "operations",
    params(("id" = i64, Path, description = "operation id")),
    responses((status = 200, description = "transcript bytes"), (status = 404))
)]
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<GetLogsQuery>,
) -> Result<impl IntoResponse> {
    let op = state.oplog.get(id).await?;
    if op.logref.is_empty() {
        return Err(AppError::NotFound(format!("operation {} has no log", id)));
    }
    let data = state.logstore.read(&op.logref).await?;
    let body = if query.full {
        data
    } else {
        truncate_for_display(&data, LOG_DISPLAY_LIMIT)
    };
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

/// Mint a time-limited download URL for an operation's full transcript.
#[utoipa::path(
    get,
    path = "/operations/{id}/download",
    context_path = "/api/v1",
    tag = "operations",
    params(("id" = i64, Path, description = "operation id")),
    responses((status = 200, body = DownloadUrlResponse), (status = 404))
)]
pub async fn get_download_url(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DownloadUrlResponse>> {
    let op = state.oplog.get(id).await?;
    if op.logref.is_empty() {
        return Err(AppError::NotFound(format!("operation {} has no log", id)));
    }
    let token = state.issue_download_token(id);
    Ok(Json(DownloadUrlResponse {
        url: format!("/download/{}", token),
        expires_in_secs: 3600,
    }))
}

/// Serve a transcript through a previously minted download token.
pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse> {
    let op_id = state
        .resolve_download_token(&token)
        .ok_or_else(|| AppError::NotFound("download token".into()))?;
    let op = state.oplog.get(op_id).await?;
    let data = state.logstore.read(&op.logref).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"operation-{}.log\"", op_id),
            ),
        ],
        data,
    ))
}
