//! Configuration endpoints: read, compare-and-set write, repo add/remove.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::config::Config;
use crate::models::repo::Repo;
use crate::services::oplog_service::OpSelector;

/// Get the current declarative configuration.
#[utoipa::path(
    get,
    path = "/config",
    context_path = "/api/v1",
    tag = "config",
    responses((status = 200, body = Config))
)]
pub async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json((*state.config.get()).clone())
}

/// Replace the configuration. The submitted `modno` must match the stored
/// one; the response carries the bumped revision.
#[utoipa::path(
    put,
    path = "/config",
    context_path = "/api/v1",
    tag = "config",
    request_body = Config,
    responses(
        (status = 200, body = Config),
        (status = 409, description = "stale modno"),
        (status = 400, description = "validation failed")
    )
)]
pub async fn set_config(
    State(state): State<AppState>,
    Json(new_config): Json<Config>,
) -> Result<Json<Config>> {
    let installed = state.config.set(new_config).await?;
    Ok(Json((*installed).clone()))
}

/// Add a repository to the configuration. A missing guid is assigned here;
/// the guid is immutable afterwards.
#[utoipa::path(
    post,
    path = "/config/repos",
    context_path = "/api/v1",
    tag = "config",
    request_body = Repo,
    responses((status = 200, body = Config))
)]
pub async fn add_repo(
    State(state): State<AppState>,
    Json(mut repo): Json<Repo>,
) -> Result<Json<Config>> {
    if repo.guid.is_empty() {
        repo.guid = Uuid::new_v4().simple().to_string();
    }
    let mut config = (*state.config.get()).clone();
    if config.repo(&repo.id).is_some() {
        return Err(AppError::Conflict(format!(
            "repo \"{}\" already exists",
            repo.id
        )));
    }
    config.repos.push(repo.clone());
    let installed = state.config.set(config).await?;

    // Initialize the repository so the first scheduled backup doesn't have
    // to. An already-initialized repo is fine; anything else is surfaced in
    // the log but does not fail the config write.
    let client = crate::services::restic_service::ResticClient::new(&state.restic_binary, repo);
    if let Err(e) = client.init(None).await {
        tracing::warn!(error = %e, "repo init after add failed");
    }

    Ok(Json((*installed).clone()))
}

/// Remove a repository. Plans targeting it are removed with it, and every
/// operation carrying its guid is deleted from the log. The repository
/// contents on disk are left untouched.
#[utoipa::path(
    delete,
    path = "/config/repos/{id}",
    context_path = "/api/v1",
    tag = "config",
    params(("id" = String, Path, description = "repo id")),
    responses((status = 200, body = Config), (status = 404))
)]
pub async fn remove_repo(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Config>> {
    let mut config = (*state.config.get()).clone();
    let repo = config
        .repo(&id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", id)))?;

    config.repos.retain(|r| r.id != id);
    config.plans.retain(|p| p.repo != id);
    let installed = state.config.set(config).await?;

    let deleted = state
        .oplog
        .delete(&OpSelector::for_repo_guid(&repo.guid))
        .await?;
    tracing::info!(repo = %id, deleted, "removed repo and its operation history");

    Ok(Json((*installed).clone()))
}
