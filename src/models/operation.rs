//! Operation records: the single unit of observability.
//!
//! Every task execution, hook run, and snapshot indexing pass is recorded as
//! an [`Operation`] in the durable operation log. Operations carry a tagged
//! payload describing what kind of work they represent.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Success,
    Error,
    Warning,
    UserCancelled,
    SystemCancelled,
}

impl OperationStatus {
    /// Terminal statuses are immutable except for administrative deletion.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::UserCancelled => "USER_CANCELLED",
            Self::SystemCancelled => "SYSTEM_CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "WARNING" => Some(Self::Warning),
            "USER_CANCELLED" => Some(Self::UserCancelled),
            "SYSTEM_CANCELLED" => Some(Self::SystemCancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight progress of a backup or restore, parsed from the backup tool's
/// JSON status stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BackupProgress {
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub files_done: u64,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub current_files: Vec<String>,
}

/// Final summary emitted by the backup tool when a backup completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BackupSummary {
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub dirs_new: u64,
    #[serde(default)]
    pub dirs_changed: u64,
    #[serde(default)]
    pub dirs_unmodified: u64,
    #[serde(default)]
    pub data_blobs: u64,
    #[serde(default)]
    pub tree_blobs: u64,
    #[serde(default)]
    pub data_added: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    #[serde(default)]
    pub total_bytes_processed: u64,
    #[serde(default)]
    pub snapshot_id: String,
}

/// Identity and metadata of a snapshot as known to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SnapshotMeta {
    pub id: String,
    /// Snapshot creation time in unix millis.
    pub unix_time_ms: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Tagged payload: what kind of work an operation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    Backup {
        #[serde(default)]
        last_status: Option<BackupProgress>,
        #[serde(default)]
        summary: Option<BackupSummary>,
        #[serde(default)]
        errors: Vec<String>,
    },
    Forget {
        /// Snapshots removed by this forget pass.
        #[serde(default)]
        removed: Vec<SnapshotMeta>,
        /// The retention policy that was applied, serialized for display.
        #[serde(default)]
        policy_json: String,
    },
    IndexSnapshot {
        snapshot: SnapshotMeta,
        /// Set once the snapshot has been forgotten from the repo.
        #[serde(default)]
        forgot: bool,
    },
    Prune {
        #[serde(default)]
        output_logref: String,
    },
    Check {
        #[serde(default)]
        output_logref: String,
    },
    Stats {
        #[serde(default)]
        total_size: u64,
        #[serde(default)]
        total_file_count: u64,
        #[serde(default)]
        snapshot_count: u64,
    },
    Restore {
        snapshot_id: String,
        #[serde(default)]
        path: String,
        target: String,
        #[serde(default)]
        last_status: Option<BackupProgress>,
    },
    RunHook {
        name: String,
        condition: String,
        #[serde(default)]
        exit_code: i32,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        output_logref: String,
    },
}

impl OperationPayload {
    /// Short kind tag used in log lines and query filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Forget { .. } => "forget",
            Self::IndexSnapshot { .. } => "index_snapshot",
            Self::Prune { .. } => "prune",
            Self::Check { .. } => "check",
            Self::Stats { .. } => "stats",
            Self::Restore { .. } => "restore",
            Self::RunHook { .. } => "run_hook",
            Self::RunCommand { .. } => "run_command",
        }
    }

    pub fn new_backup() -> Self {
        Self::Backup {
            last_status: None,
            summary: None,
            errors: Vec::new(),
        }
    }
}

/// A single operation record.
///
/// `id` and `modno` are assigned by the operation log on insert; an `id` of
/// zero means "not yet persisted". The first operation of a flow has
/// `id == flow_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub modno: i64,
    pub instance_id: String,
    #[serde(default)]
    pub original_instance_keyid: String,
    /// Id of this operation in its origin instance's log; zero for local ops.
    #[serde(default)]
    pub original_id: i64,
    #[serde(default)]
    pub repo_id: String,
    #[serde(default)]
    pub repo_guid: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub flow_id: i64,
    #[serde(default)]
    pub snapshot_id: String,
    pub unix_time_start_ms: i64,
    #[serde(default)]
    pub unix_time_end_ms: i64,
    pub status: OperationStatus,
    #[serde(default)]
    pub display_message: String,
    #[serde(default)]
    pub logref: String,
    pub payload: OperationPayload,
}

impl Operation {
    /// Build a fresh, unpersisted operation for the given target.
    pub fn new(
        instance_id: &str,
        repo_id: &str,
        repo_guid: &str,
        plan_id: &str,
        start: DateTime<Utc>,
        payload: OperationPayload,
    ) -> Self {
        Self {
            id: 0,
            modno: 0,
            instance_id: instance_id.to_string(),
            original_instance_keyid: String::new(),
            original_id: 0,
            repo_id: repo_id.to_string(),
            repo_guid: repo_guid.to_string(),
            plan_id: plan_id.to_string(),
            flow_id: 0,
            snapshot_id: String::new(),
            unix_time_start_ms: start.timestamp_millis(),
            unix_time_end_ms: 0,
            status: OperationStatus::Pending,
            display_message: String::new(),
            logref: String::new(),
            payload,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.unix_time_start_ms)
            .single()
            .unwrap_or_default()
    }

    /// Finalize with the given status; end time never precedes start time.
    pub fn finalize(&mut self, status: OperationStatus, end: DateTime<Utc>) {
        self.status = status;
        self.unix_time_end_ms = end.timestamp_millis().max(self.unix_time_start_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::InProgress.is_terminal());
        assert!(OperationStatus::Success.is_terminal());
        assert!(OperationStatus::Error.is_terminal());
        assert!(OperationStatus::Warning.is_terminal());
        assert!(OperationStatus::UserCancelled.is_terminal());
        assert!(OperationStatus::SystemCancelled.is_terminal());
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::InProgress,
            OperationStatus::Success,
            OperationStatus::Error,
            OperationStatus::Warning,
            OperationStatus::UserCancelled,
            OperationStatus::SystemCancelled,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OperationStatus::parse("NO_SUCH"), None);
    }

    #[test]
    fn payload_serializes_tagged() {
        let payload = OperationPayload::RunCommand {
            command: "help".into(),
            output_logref: "ab/cdef".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"run_command""#));

        let back: OperationPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn finalize_clamps_end_time() {
        let start = Utc::now();
        let mut op = Operation::new("inst", "r", "guid", "p", start, OperationPayload::new_backup());
        op.finalize(OperationStatus::Success, start - chrono::Duration::seconds(5));
        assert_eq!(op.unix_time_end_ms, op.unix_time_start_ms);
        assert_eq!(op.status, OperationStatus::Success);
    }
}
