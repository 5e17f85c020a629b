//! Route definitions for the API.

use axum::{
    routing::{delete, get, post},
    Router,
};
use utoipa_swagger_ui::SwaggerUi;

use super::{handlers, AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let api_v1 = Router::new()
        // Configuration
        .route(
            "/config",
            get(handlers::config::get_config).put(handlers::config::set_config),
        )
        .route("/config/repos", post(handlers::config::add_repo))
        .route("/config/repos/{id}", delete(handlers::config::remove_repo))
        // Plan-scoped tasks
        .route("/plans/{id}/backup", post(handlers::plans::backup))
        .route("/plans/forget", post(handlers::plans::forget))
        .route("/restore", post(handlers::plans::restore))
        // Repo-scoped tasks and browsing
        .route("/repos/{id}/task", post(handlers::repos::do_repo_task))
        .route("/repos/{id}/index", post(handlers::repos::index_snapshots))
        .route("/repos/{id}/snapshots", get(handlers::repos::list_snapshots))
        .route(
            "/repos/{id}/snapshots/{snapshot_id}/files",
            get(handlers::repos::list_snapshot_files),
        )
        .route("/repos/{id}/command", post(handlers::repos::run_command))
        // Operation log
        .route("/operations/query", post(handlers::operations::get_operations))
        .route("/operations/clear", post(handlers::operations::clear_history))
        .route("/operations/{id}", get(handlers::operations::get_operation))
        .route(
            "/operations/{id}/cancel",
            post(handlers::operations::cancel_operation),
        )
        .route("/operations/{id}/logs", get(handlers::operations::get_logs))
        .route(
            "/operations/{id}/download",
            get(handlers::operations::get_download_url),
        )
        // Event stream
        .route("/events/operations", get(handlers::events::operation_events))
        // Peer sync bridge
        .route(
            "/sync/operations",
            get(handlers::sync::local_operations).post(handlers::sync::apply_remote_operations),
        )
        .route("/sync/announce", post(handlers::sync::announce_repo_list))
        // Instance-wide
        .route("/summary", get(handlers::system::summary_dashboard))
        .route("/autocomplete/path", get(handlers::system::path_autocomplete));

    Router::new()
        // Health endpoints (no auth required)
        .route("/health", get(handlers::health::health_check))
        .route("/healthz", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        // OpenAPI spec and Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api/v1/openapi.json", super::openapi::build_openapi()))
        // Token-gated transcript downloads
        .route("/download/{token}", get(handlers::operations::download))
        // API v1 routes
        .nest("/api/v1", api_v1)
        .with_state(state)
}
