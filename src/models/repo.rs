//! Repository declarations: where backups are stored and how the repo is
//! maintained.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::hook::Hook;
use crate::models::plan::SchedulePolicy;

/// Maintenance policy for `prune` passes on a repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PrunePolicy {
    #[serde(default)]
    pub schedule: SchedulePolicy,
    /// Repack when more than this percentage of pack data is unused.
    #[serde(default = "default_max_unused_percent")]
    pub max_unused_percent: f64,
}

fn default_max_unused_percent() -> f64 {
    10.0
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            schedule: SchedulePolicy::disabled(),
            max_unused_percent: default_max_unused_percent(),
        }
    }
}

/// Maintenance policy for `check` passes on a repo.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct CheckPolicy {
    #[serde(default)]
    pub schedule: SchedulePolicy,
    /// Percentage of pack data to re-read and verify; zero checks structure
    /// only.
    #[serde(default)]
    pub read_data_percent: f64,
}

/// A declared backup repository.
///
/// `guid` and `uri` are immutable after creation: a change of uri forces a
/// new guid, which severs the operation history join on purpose.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct Repo {
    /// Human-assigned id, unique within the config.
    pub id: String,
    /// Stable identifier, independent of id and uri. Joins operations
    /// across instances.
    pub guid: String,
    pub uri: String,
    pub password: String,
    /// Extra environment for the backup tool (e.g. cloud credentials).
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Extra command-line flags passed on every invocation.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub prune_policy: PrunePolicy,
    #[serde(default)]
    pub check_policy: CheckPolicy,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    /// Run `unlock` before mutating operations when the repo may hold a
    /// stale lock from a crashed instance.
    #[serde(default)]
    pub auto_unlock: bool,
}

/// A single environment variable entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}
