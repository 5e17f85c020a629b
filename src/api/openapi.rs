//! OpenAPI document for the RPC surface.

use utoipa::OpenApi;

use crate::api::dto;
use crate::models::config::Config;
use crate::models::hook::{Hook, HookAction, HookCondition, HookOnError};
use crate::models::operation::{
    BackupProgress, BackupSummary, Operation, OperationPayload, OperationStatus, SnapshotMeta,
};
use crate::models::plan::{Plan, RetentionPolicy, Schedule, ScheduleClock, SchedulePolicy};
use crate::models::repo::{CheckPolicy, EnvVar, PrunePolicy, Repo};
use crate::services::restic_service::LsEntry;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Backrest Orchestration API",
        description = "Backup orchestration engine: configuration, scheduled tasks, and the operation log."
    ),
    paths(
        crate::api::handlers::config::get_config,
        crate::api::handlers::config::set_config,
        crate::api::handlers::config::add_repo,
        crate::api::handlers::config::remove_repo,
        crate::api::handlers::plans::backup,
        crate::api::handlers::plans::forget,
        crate::api::handlers::plans::restore,
        crate::api::handlers::repos::do_repo_task,
        crate::api::handlers::repos::index_snapshots,
        crate::api::handlers::repos::list_snapshots,
        crate::api::handlers::repos::list_snapshot_files,
        crate::api::handlers::repos::run_command,
        crate::api::handlers::operations::get_operations,
        crate::api::handlers::operations::get_operation,
        crate::api::handlers::operations::cancel_operation,
        crate::api::handlers::operations::clear_history,
        crate::api::handlers::operations::get_logs,
        crate::api::handlers::operations::get_download_url,
        crate::api::handlers::events::operation_events,
        crate::api::handlers::sync::apply_remote_operations,
        crate::api::handlers::sync::announce_repo_list,
        crate::api::handlers::sync::local_operations,
        crate::api::handlers::system::summary_dashboard,
        crate::api::handlers::system::path_autocomplete,
        crate::api::handlers::health::health_check,
        crate::api::handlers::health::readiness_check,
    ),
    components(schemas(
        Config,
        Repo,
        Plan,
        EnvVar,
        PrunePolicy,
        CheckPolicy,
        Schedule,
        SchedulePolicy,
        ScheduleClock,
        RetentionPolicy,
        Hook,
        HookAction,
        HookCondition,
        HookOnError,
        Operation,
        OperationStatus,
        OperationPayload,
        BackupProgress,
        BackupSummary,
        SnapshotMeta,
        LsEntry,
        dto::SelectorDto,
        dto::GetOperationsRequest,
        dto::OperationList,
        dto::ClearHistoryRequest,
        dto::ClearHistoryResponse,
        dto::OpIdResponse,
        dto::RestoreRequest,
        dto::ForgetRequest,
        dto::RunCommandRequest,
        dto::RepoTaskKind,
        dto::DoRepoTaskRequest,
        dto::DownloadUrlResponse,
        dto::ApplyRemoteOperationsRequest,
        dto::ApplyRemoteOperationsResponse,
        dto::AnnounceRepoListRequest,
        dto::SnapshotList,
        dto::PlanSummary,
        dto::SummaryDashboard,
        dto::PathAutocompleteResponse,
    ))
)]
struct ApiDoc;

/// Build the OpenAPI document served at `/api/v1/openapi.json`.
pub fn build_openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
