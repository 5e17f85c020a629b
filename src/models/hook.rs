//! Hooks: user-configured side effects fired on task lifecycle conditions.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle condition a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookCondition {
    SnapshotStart,
    SnapshotEnd,
    SnapshotSuccess,
    SnapshotError,
    SnapshotWarningError,
    SnapshotSkipped,
    AnyError,
    CheckStart,
    CheckEnd,
    PruneStart,
    PruneEnd,
    Unknown,
}

impl HookCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotStart => "SNAPSHOT_START",
            Self::SnapshotEnd => "SNAPSHOT_END",
            Self::SnapshotSuccess => "SNAPSHOT_SUCCESS",
            Self::SnapshotError => "SNAPSHOT_ERROR",
            Self::SnapshotWarningError => "SNAPSHOT_WARNING_ERROR",
            Self::SnapshotSkipped => "SNAPSHOT_SKIPPED",
            Self::AnyError => "ANY_ERROR",
            Self::CheckStart => "CHECK_START",
            Self::CheckEnd => "CHECK_END",
            Self::PruneStart => "PRUNE_START",
            Self::PruneEnd => "PRUNE_END",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for HookCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a hook itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookOnError {
    #[default]
    Ignore,
    /// Cancel the surrounding task; it terminates as USER_CANCELLED.
    Cancel,
    /// Fail the surrounding task; it terminates as ERROR.
    Fatal,
    #[serde(rename = "RETRY_1MIN")]
    Retry1Min,
    #[serde(rename = "RETRY_10MIN")]
    Retry10Min,
}

/// The side effect a hook performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    /// Run a shell script through `sh -c` with template expansion.
    Command { command: String },
    Discord { webhook_url: String, #[serde(default)] template: String },
    Slack { webhook_url: String, #[serde(default)] template: String },
    Gotify {
        base_url: String,
        token: String,
        #[serde(default)]
        title_template: String,
        #[serde(default)]
        template: String,
    },
    Shoutrrr { shoutrrr_url: String, #[serde(default)] template: String },
    Healthchecks { ping_url: String, #[serde(default)] template: String },
}

/// A configured hook on a plan or repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Hook {
    pub conditions: Vec<HookCondition>,
    #[serde(flatten)]
    pub action: HookAction,
    #[serde(default)]
    pub on_error: HookOnError,
}

impl Hook {
    pub fn matches(&self, condition: HookCondition) -> bool {
        self.conditions.contains(&condition)
    }

    /// Short name for operation records and log lines.
    pub fn name(&self) -> String {
        match &self.action {
            HookAction::Command { .. } => "command".to_string(),
            HookAction::Discord { .. } => "discord".to_string(),
            HookAction::Slack { .. } => "slack".to_string(),
            HookAction::Gotify { .. } => "gotify".to_string(),
            HookAction::Shoutrrr { .. } => "shoutrrr".to_string(),
            HookAction::Healthchecks { .. } => "healthchecks".to_string(),
        }
    }

    /// Every template carried by this hook, for validation.
    pub fn templates(&self) -> Vec<&str> {
        match &self.action {
            HookAction::Command { command } => vec![command.as_str()],
            HookAction::Discord { template, .. }
            | HookAction::Slack { template, .. }
            | HookAction::Shoutrrr { template, .. }
            | HookAction::Healthchecks { template, .. } => vec![template.as_str()],
            HookAction::Gotify { title_template, template, .. } => {
                vec![title_template.as_str(), template.as_str()]
            }
        }
    }
}
