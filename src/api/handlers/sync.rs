//! Peer synchronization endpoints: the inbound half of the sync bridge
//! contract.

use axum::extract::State;
use axum::Json;

use crate::api::dto::{
    AnnounceRepoListRequest, ApplyRemoteOperationsRequest, ApplyRemoteOperationsResponse,
    OperationList,
};
use crate::api::AppState;
use crate::error::Result;

/// Apply operations received from a peer. Insert-or-update only, keyed on
/// origin identity; deletion never travels this path and nothing received
/// here is ever scheduled.
#[utoipa::path(
    post,
    path = "/sync/operations",
    context_path = "/api/v1",
    tag = "sync",
    request_body = ApplyRemoteOperationsRequest,
    responses((status = 200, body = ApplyRemoteOperationsResponse))
)]
pub async fn apply_remote_operations(
    State(state): State<AppState>,
    Json(request): Json<ApplyRemoteOperationsRequest>,
) -> Result<Json<ApplyRemoteOperationsResponse>> {
    let applied = state.sync.apply_remote_operations(request.operations).await?;
    Ok(Json(ApplyRemoteOperationsResponse { applied }))
}

/// Record the repo guids a peer announces it holds.
#[utoipa::path(
    post,
    path = "/sync/announce",
    context_path = "/api/v1",
    tag = "sync",
    request_body = AnnounceRepoListRequest,
    responses((status = 200))
)]
pub async fn announce_repo_list(
    State(state): State<AppState>,
    Json(request): Json<AnnounceRepoListRequest>,
) -> Json<serde_json::Value> {
    state
        .sync
        .announce_repo_list(&request.peer_instance_id, request.repo_guids)
        .await;
    Json(serde_json::json!({ "ok": true }))
}

/// This instance's own operations, for a peer's initial sweep. Pairs with
/// the event stream for incremental follow-up.
#[utoipa::path(
    get,
    path = "/sync/operations",
    context_path = "/api/v1",
    tag = "sync",
    responses((status = 200, body = OperationList))
)]
pub async fn local_operations(State(state): State<AppState>) -> Result<Json<OperationList>> {
    let operations = state.sync.local_operations().await?;
    Ok(Json(OperationList { operations }))
}
