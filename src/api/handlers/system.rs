//! Instance-wide endpoints: summary dashboard and path autocomplete.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;

use crate::api::dto::{
    PathAutocompleteQuery, PathAutocompleteResponse, PlanSummary, SummaryDashboard,
};
use crate::api::AppState;
use crate::error::Result;
use crate::models::operation::{OperationPayload, OperationStatus};
use crate::services::oplog_service::OpSelector;

/// Aggregate recent activity for the UI landing page.
#[utoipa::path(
    get,
    path = "/summary",
    context_path = "/api/v1",
    tag = "system",
    responses((status = 200, body = SummaryDashboard))
)]
pub async fn summary_dashboard(State(state): State<AppState>) -> Result<Json<SummaryDashboard>> {
    let cfg = state.config.get();
    let horizon = (Utc::now() - chrono::Duration::days(30)).timestamp_millis();

    let mut summaries: HashMap<String, PlanSummary> = cfg
        .plans
        .iter()
        .map(|plan| {
            (
                plan.id.clone(),
                PlanSummary {
                    plan_id: plan.id.clone(),
                    repo_id: plan.repo.clone(),
                    last_backup_ms: None,
                    last_status: None,
                    recent_successes: 0,
                    recent_failures: 0,
                    recent_bytes_added: 0,
                },
            )
        })
        .collect();

    let backups = state
        .oplog
        .query(&OpSelector {
            kinds: Some(vec!["backup".into()]),
            ..Default::default()
        })
        .await?;

    for op in &backups {
        let Some(summary) = summaries.get_mut(&op.plan_id) else { continue };
        if op.status.is_terminal()
            && summary.last_backup_ms.map_or(true, |t| op.unix_time_start_ms > t)
        {
            summary.last_backup_ms = Some(op.unix_time_start_ms);
            summary.last_status = Some(op.status);
        }
        if op.unix_time_start_ms < horizon {
            continue;
        }
        match op.status {
            OperationStatus::Success | OperationStatus::Warning => {
                summary.recent_successes += 1;
                if let OperationPayload::Backup {
                    summary: Some(backup_summary),
                    ..
                } = &op.payload
                {
                    summary.recent_bytes_added += backup_summary.data_added;
                }
            }
            OperationStatus::Error
            | OperationStatus::UserCancelled
            | OperationStatus::SystemCancelled => summary.recent_failures += 1,
            _ => {}
        }
    }

    let mut plans: Vec<PlanSummary> = summaries.into_values().collect();
    plans.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));

    Ok(Json(SummaryDashboard {
        instance_id: state.oplog.instance_id().to_string(),
        plans,
        queued_tasks: state.orchestrator.queue_len(),
        active_tasks: state.orchestrator.active_executions(),
    }))
}

/// Complete a filesystem path prefix, for plan path pickers.
#[utoipa::path(
    get,
    path = "/autocomplete/path",
    context_path = "/api/v1",
    tag = "system",
    params(PathAutocompleteQuery),
    responses((status = 200, body = PathAutocompleteResponse))
)]
pub async fn path_autocomplete(
    Query(query): Query<PathAutocompleteQuery>,
) -> Json<PathAutocompleteResponse> {
    let prefix = query.prefix;
    let (dir, partial) = match prefix.rsplit_once('/') {
        Some((dir, partial)) => {
            let dir = if dir.is_empty() { "/" } else { dir };
            (dir.to_string(), partial.to_string())
        }
        None => (".".to_string(), prefix.clone()),
    };

    let mut paths = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&partial) {
                continue;
            }
            let full = if dir == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", dir, name)
            };
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            paths.push(if is_dir { format!("{}/", full) } else { full });
            if paths.len() >= 50 {
                break;
            }
        }
    }
    paths.sort();
    Json(PathAutocompleteResponse { paths })
}
