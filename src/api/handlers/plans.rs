//! Plan-scoped task endpoints: backup, forget, restore.

use axum::extract::{Path, State};
use axum::Json;

use crate::api::dto::{ForgetRequest, OpIdResponse, RestoreRequest};
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::services::tasks::{Task, TaskKind};

/// Await an interactive task's completion channel.
async fn await_completion(
    rx: tokio::sync::oneshot::Receiver<std::result::Result<i64, String>>,
) -> Result<i64> {
    match rx.await {
        Ok(Ok(op_id)) => Ok(op_id),
        Ok(Err(message)) => Err(AppError::Internal(message)),
        Err(_) => Err(AppError::Internal("task dropped before completion".into())),
    }
}

/// Run a plan's backup now. Blocks until the backup task (not its follow-up
/// forget) reaches a terminal state.
#[utoipa::path(
    post,
    path = "/plans/{id}/backup",
    context_path = "/api/v1",
    tag = "plans",
    params(("id" = String, Path, description = "plan id")),
    responses((status = 200, body = OpIdResponse), (status = 404))
)]
pub async fn backup(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Json<OpIdResponse>> {
    let cfg = state.config.get();
    let plan = cfg
        .plan(&plan_id)
        .ok_or_else(|| AppError::NotFound(format!("plan \"{}\"", plan_id)))?;
    let repo = cfg
        .repo_for_plan(plan)
        .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", plan.repo)))?;

    let (task, rx) = Task::new(
        TaskKind::Backup {
            plan_id: plan_id.clone(),
        },
        &repo.guid,
        &plan_id,
        chrono::Utc::now(),
    )
    .interactive();
    state.orchestrator.enqueue(task);

    let op_id = await_completion(rx).await?;
    Ok(Json(OpIdResponse { op_id }))
}

/// Apply a plan's retention policy now, or forget one specific snapshot.
#[utoipa::path(
    post,
    path = "/plans/forget",
    context_path = "/api/v1",
    tag = "plans",
    request_body = ForgetRequest,
    responses((status = 200, body = OpIdResponse), (status = 404))
)]
pub async fn forget(
    State(state): State<AppState>,
    Json(request): Json<ForgetRequest>,
) -> Result<Json<OpIdResponse>> {
    let cfg = state.config.get();
    let plan = cfg
        .plan(&request.plan_id)
        .ok_or_else(|| AppError::NotFound(format!("plan \"{}\"", request.plan_id)))?;
    let repo = cfg
        .repo_for_plan(plan)
        .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", plan.repo)))?;

    let (task, rx) = Task::new(
        TaskKind::Forget {
            plan_id: request.plan_id.clone(),
            snapshot_id: request.snapshot_id,
        },
        &repo.guid,
        &request.plan_id,
        chrono::Utc::now(),
    )
    .interactive();
    state.orchestrator.enqueue(task);

    let op_id = await_completion(rx).await?;
    Ok(Json(OpIdResponse { op_id }))
}

/// Restore a snapshot (optionally a sub-path) into a target directory.
#[utoipa::path(
    post,
    path = "/restore",
    context_path = "/api/v1",
    tag = "plans",
    request_body = RestoreRequest,
    responses((status = 200, body = OpIdResponse), (status = 404))
)]
pub async fn restore(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<OpIdResponse>> {
    let cfg = state.config.get();
    let repo = cfg
        .repo(&request.repo_id)
        .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", request.repo_id)))?;

    let (task, rx) = Task::new(
        TaskKind::Restore {
            repo_id: request.repo_id.clone(),
            plan_id: request.plan_id.clone(),
            snapshot_id: request.snapshot_id.clone(),
            path: request.path.clone(),
            target: request.target.clone(),
        },
        &repo.guid,
        &request.plan_id,
        chrono::Utc::now(),
    )
    .interactive();
    state.orchestrator.enqueue(task);

    let op_id = await_completion(rx).await?;
    Ok(Json(OpIdResponse { op_id }))
}
