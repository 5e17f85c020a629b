//! Request/response DTOs for the RPC surface, plus the display truncation
//! rules applied by log-serving handlers.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::operation::{Operation, OperationStatus};
use crate::services::oplog_service::OpSelector;

/// Viewer clients cap transcripts at 32 KB: first and last 16 KB.
pub const LOG_DISPLAY_LIMIT: usize = 32 * 1024;
/// Errors are capped at ~500 bytes: first and last 250.
pub const ERROR_DISPLAY_LIMIT: usize = 500;

/// Selector over operations, as accepted by the query endpoints. All fields
/// are conjunctive; omitted fields match everything.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SelectorDto {
    #[serde(default)]
    pub ids: Option<Vec<i64>>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub original_instance_keyid: Option<String>,
    #[serde(default)]
    pub repo_guid: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub flow_id: Option<i64>,
    #[serde(default)]
    pub statuses: Option<Vec<OperationStatus>>,
    #[serde(default)]
    pub started_after_ms: Option<i64>,
    #[serde(default)]
    pub started_before_ms: Option<i64>,
}

impl SelectorDto {
    pub fn into_selector(self) -> OpSelector {
        OpSelector {
            ids: self.ids,
            instance_id: self.instance_id,
            original_instance_keyid: self.original_instance_keyid,
            repo_guid: self.repo_guid,
            plan_id: self.plan_id,
            snapshot_id: self.snapshot_id,
            flow_id: self.flow_id,
            kinds: None,
            statuses: self.statuses,
            started_after_ms: self.started_after_ms,
            started_before_ms: self.started_before_ms,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GetOperationsRequest {
    #[serde(default)]
    pub selector: SelectorDto,
    /// When set, only the newest N matching operations are returned.
    #[serde(default)]
    pub last_n: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OperationList {
    pub operations: Vec<Operation>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClearHistoryRequest {
    #[serde(default)]
    pub selector: SelectorDto,
    /// Restrict clearing to failed (error or cancelled) operations.
    #[serde(default)]
    pub only_failed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearHistoryResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpIdResponse {
    pub op_id: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RestoreRequest {
    pub repo_id: String,
    #[serde(default)]
    pub plan_id: String,
    pub snapshot_id: String,
    /// Sub-path within the snapshot to restore; everything when omitted.
    #[serde(default)]
    pub path: Option<String>,
    pub target: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ForgetRequest {
    pub plan_id: String,
    /// Forget one snapshot instead of applying the plan's retention.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RunCommandRequest {
    pub command: String,
}

/// Maintenance task kinds accepted by DoRepoTask.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RepoTaskKind {
    Prune,
    Check,
    Stats,
    IndexSnapshots,
    Unlock,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DoRepoTaskRequest {
    pub task: RepoTaskKind,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DownloadUrlResponse {
    pub url: String,
    /// Seconds until the URL stops working.
    pub expires_in_secs: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyRemoteOperationsRequest {
    pub operations: Vec<Operation>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApplyRemoteOperationsResponse {
    pub applied: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnnounceRepoListRequest {
    pub peer_instance_id: String,
    pub repo_guids: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SnapshotList {
    pub snapshots: Vec<crate::models::operation::SnapshotMeta>,
}

/// Per-plan roll-up for the summary dashboard.
#[derive(Debug, Serialize, ToSchema)]
pub struct PlanSummary {
    pub plan_id: String,
    pub repo_id: String,
    pub last_backup_ms: Option<i64>,
    pub last_status: Option<OperationStatus>,
    /// Successful backups in the trailing 30 days.
    pub recent_successes: u64,
    /// Failed backups in the trailing 30 days.
    pub recent_failures: u64,
    /// Bytes added by backups in the trailing 30 days.
    pub recent_bytes_added: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SummaryDashboard {
    pub instance_id: String,
    pub plans: Vec<PlanSummary>,
    pub queued_tasks: usize,
    pub active_tasks: usize,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct PathAutocompleteQuery {
    pub prefix: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PathAutocompleteResponse {
    pub paths: Vec<String>,
}

/// Cap a transcript for display: first and last half of the limit with an
/// elision marker in between. The log store itself is never truncated.
pub fn truncate_for_display(data: &[u8], limit: usize) -> Vec<u8> {
    if data.len() <= limit {
        return data.to_vec();
    }
    let half = limit / 2;
    let mut out = Vec::with_capacity(limit + 32);
    out.extend_from_slice(&data[..half]);
    out.extend_from_slice(b"\n... [truncated] ...\n");
    out.extend_from_slice(&data[data.len() - half..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_logs_pass_through() {
        let data = b"short output".to_vec();
        assert_eq!(truncate_for_display(&data, LOG_DISPLAY_LIMIT), data);
    }

    #[test]
    fn long_logs_keep_head_and_tail() {
        let data = vec![b'x'; 100_000];
        let out = truncate_for_display(&data, LOG_DISPLAY_LIMIT);
        assert!(out.len() < data.len());
        assert!(out.len() >= LOG_DISPLAY_LIMIT);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("[truncated]"));
    }

    #[test]
    fn error_truncation_is_250_plus_250() {
        let data = vec![b'e'; 2_000];
        let out = truncate_for_display(&data, ERROR_DISPLAY_LIMIT);
        let text = String::from_utf8_lossy(&out);
        let parts: Vec<&str> = text.split("\n... [truncated] ...\n").collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 250);
        assert_eq!(parts[1].len(), 250);
    }

    #[test]
    fn selector_dto_maps_fields() {
        let dto = SelectorDto {
            flow_id: Some(9),
            repo_guid: Some("guid".into()),
            ..Default::default()
        };
        let selector = dto.into_selector();
        assert_eq!(selector.flow_id, Some(9));
        assert_eq!(selector.repo_guid.as_deref(), Some("guid"));
        assert!(selector.kinds.is_none());
    }
}
