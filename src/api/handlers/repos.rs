//! Repo-scoped endpoints: maintenance tasks, snapshot listing, ad-hoc
//! commands.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::dto::{DoRepoTaskRequest, OpIdResponse, RepoTaskKind, RunCommandRequest, SnapshotList};
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::repo::Repo;
use crate::services::restic_service::{LsEntry, ResticClient};
use crate::services::tasks::{Task, TaskKind, PRIORITY_MAINTENANCE};

fn lookup_repo(state: &AppState, repo_id: &str) -> Result<Repo> {
    state
        .config
        .get()
        .repo(repo_id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", repo_id)))
}

async fn await_completion(
    rx: tokio::sync::oneshot::Receiver<std::result::Result<i64, String>>,
) -> Result<i64> {
    match rx.await {
        Ok(Ok(op_id)) => Ok(op_id),
        Ok(Err(message)) => Err(AppError::Internal(message)),
        Err(_) => Err(AppError::Internal("task dropped before completion".into())),
    }
}

/// Run a maintenance task against a repo: prune, check, stats, snapshot
/// indexing, or unlock.
#[utoipa::path(
    post,
    path = "/repos/{id}/task",
    context_path = "/api/v1",
    tag = "repos",
    params(("id" = String, Path, description = "repo id")),
    request_body = DoRepoTaskRequest,
    responses((status = 200, body = OpIdResponse), (status = 404))
)]
pub async fn do_repo_task(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(request): Json<DoRepoTaskRequest>,
) -> Result<Json<OpIdResponse>> {
    let repo = lookup_repo(&state, &repo_id)?;

    let kind = match request.task {
        RepoTaskKind::Prune => TaskKind::Prune {
            repo_id: repo_id.clone(),
        },
        RepoTaskKind::Check => TaskKind::Check {
            repo_id: repo_id.clone(),
        },
        RepoTaskKind::Stats => TaskKind::Stats {
            repo_id: repo_id.clone(),
        },
        RepoTaskKind::IndexSnapshots => TaskKind::IndexSnapshots {
            repo_id: repo_id.clone(),
        },
        RepoTaskKind::Unlock => TaskKind::RunCommand {
            repo_id: repo_id.clone(),
            command: "unlock".into(),
        },
    };

    let (task, rx) = Task::new(kind, &repo.guid, "", chrono::Utc::now())
        .with_priority(PRIORITY_MAINTENANCE)
        .interactive();
    state.orchestrator.enqueue(task);

    let op_id = await_completion(rx).await?;
    Ok(Json(OpIdResponse { op_id }))
}

/// Reconcile the repo's real snapshot list with the operation log.
#[utoipa::path(
    post,
    path = "/repos/{id}/index",
    context_path = "/api/v1",
    tag = "repos",
    params(("id" = String, Path, description = "repo id")),
    responses((status = 200), (status = 404))
)]
pub async fn index_snapshots(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let repo = lookup_repo(&state, &repo_id)?;
    let (task, rx) = Task::new(
        TaskKind::IndexSnapshots {
            repo_id: repo_id.clone(),
        },
        &repo.guid,
        "",
        chrono::Utc::now(),
    )
    .interactive();
    state.orchestrator.enqueue(task);

    await_completion(rx).await?;
    Ok(Json(serde_json::json!({ "indexed": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSnapshotsQuery {
    /// Restrict to snapshots created by this plan.
    #[serde(default)]
    pub plan_id: Option<String>,
}

/// List the repo's snapshots straight from the backup tool.
#[utoipa::path(
    get,
    path = "/repos/{id}/snapshots",
    context_path = "/api/v1",
    tag = "repos",
    params(("id" = String, Path, description = "repo id")),
    responses((status = 200, body = SnapshotList), (status = 404))
)]
pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Query(query): Query<ListSnapshotsQuery>,
) -> Result<Json<SnapshotList>> {
    let repo = lookup_repo(&state, &repo_id)?;
    let client = ResticClient::new(&state.restic_binary, repo);

    let tag = query.plan_id.map(|p| format!("plan:{}", p));
    let snapshots = client.snapshots(tag.as_deref()).await?;
    Ok(Json(SnapshotList {
        snapshots: snapshots.iter().map(|s| s.to_meta()).collect(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFilesQuery {
    #[serde(default)]
    pub path: String,
}

/// List files within a snapshot under a path prefix.
#[utoipa::path(
    get,
    path = "/repos/{id}/snapshots/{snapshot_id}/files",
    context_path = "/api/v1",
    tag = "repos",
    params(
        ("id" = String, Path, description = "repo id"),
        ("snapshot_id" = String, Path, description = "snapshot id")
    ),
    responses((status = 200, body = [LsEntry]), (status = 404))
)]
pub async fn list_snapshot_files(
    State(state): State<AppState>,
    Path((repo_id, snapshot_id)): Path<(String, String)>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<LsEntry>>> {
    let repo = lookup_repo(&state, &repo_id)?;
    let client = ResticClient::new(&state.restic_binary, repo);
    let entries = client.ls(&snapshot_id, &query.path).await?;
    Ok(Json(entries))
}

/// Run an arbitrary backup-tool subcommand against the repo. Returns once
/// the command has finished; the transcript is behind the operation's
/// logref.
#[utoipa::path(
    post,
    path = "/repos/{id}/command",
    context_path = "/api/v1",
    tag = "repos",
    params(("id" = String, Path, description = "repo id")),
    request_body = RunCommandRequest,
    responses((status = 200, body = OpIdResponse), (status = 404))
)]
pub async fn run_command(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(request): Json<RunCommandRequest>,
) -> Result<Json<OpIdResponse>> {
    let repo = lookup_repo(&state, &repo_id)?;
    let (task, rx) = Task::new(
        TaskKind::RunCommand {
            repo_id: repo_id.clone(),
            command: request.command,
        },
        &repo.guid,
        "",
        chrono::Utc::now(),
    )
    .interactive();
    state.orchestrator.enqueue(task);

    let op_id = await_completion(rx).await?;
    Ok(Json(OpIdResponse { op_id }))
}
