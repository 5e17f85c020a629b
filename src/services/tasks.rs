//! The task model: units of scheduled work executed by the runner.
//!
//! A task names what to do and against which repo/plan; the runner turns it
//! into operation records. Tasks touching the same repo are serialized by
//! the scheduler's per-repo locks.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::models::plan::SchedulePolicy;

/// Interactive (user-initiated) tasks run before scheduled work due at the
/// same instant.
pub const PRIORITY_INTERACTIVE: i32 = -10;
pub const PRIORITY_DEFAULT: i32 = 0;
/// Repo maintenance: prune, check, garbage collection.
pub const PRIORITY_MAINTENANCE: i32 = 10;
/// Stats collection runs after everything else.
pub const PRIORITY_STATS: i32 = 100;

/// What a task does. Repo and plan affinity live on the [`Task`] itself.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Backup {
        plan_id: String,
    },
    Forget {
        plan_id: String,
        /// Forget one specific snapshot instead of applying the plan's
        /// retention policy.
        snapshot_id: Option<String>,
    },
    Prune {
        repo_id: String,
    },
    Check {
        repo_id: String,
    },
    IndexSnapshots {
        repo_id: String,
    },
    Restore {
        repo_id: String,
        plan_id: String,
        snapshot_id: String,
        path: Option<String>,
        target: String,
    },
    Stats {
        repo_id: String,
    },
    CollectGarbage,
    RunCommand {
        repo_id: String,
        command: String,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Forget { .. } => "forget",
            Self::Prune { .. } => "prune",
            Self::Check { .. } => "check",
            Self::IndexSnapshots { .. } => "index_snapshots",
            Self::Restore { .. } => "restore",
            Self::Stats { .. } => "stats",
            Self::CollectGarbage => "collect_garbage",
            Self::RunCommand { .. } => "run_command",
        }
    }
}

/// Sent on the completion channel of interactive tasks: the finished
/// operation id, or a failure message.
pub type TaskCompletion = std::result::Result<i64, String>;

/// A schedulable unit of work.
#[derive(Debug)]
pub struct Task {
    pub kind: TaskKind,
    /// Guid of the repo this task mutates; empty for repo-agnostic tasks.
    pub repo_guid: String,
    /// Plan this task belongs to; empty for plan-agnostic tasks.
    pub plan_id: String,
    pub priority: i32,
    /// Flow to join; `None` starts a new flow.
    pub flow_id: Option<i64>,
    pub run_at: DateTime<Utc>,
    /// When present, the task re-enqueues itself after completion.
    pub schedule: Option<SchedulePolicy>,
    /// Operation to resume, set when a RETRY hook policy requeued the task.
    pub op_id: Option<i64>,
    /// Completion channel for interactive tasks.
    pub done: Option<oneshot::Sender<TaskCompletion>>,
}

impl Task {
    pub fn new(kind: TaskKind, repo_guid: &str, plan_id: &str, run_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            repo_guid: repo_guid.to_string(),
            plan_id: plan_id.to_string(),
            priority: PRIORITY_DEFAULT,
            flow_id: None,
            run_at,
            schedule: None,
            op_id: None,
            done: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, schedule: SchedulePolicy) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn in_flow(mut self, flow_id: i64) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    /// Attach a completion channel; returns the receiving end.
    pub fn interactive(mut self) -> (Self, oneshot::Receiver<TaskCompletion>) {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        self.priority = PRIORITY_INTERACTIVE;
        (self, rx)
    }

    /// A fresh task with the same identity, used for re-enqueueing
    /// scheduled work. Interactive state (completion channel, resumed op)
    /// is not carried over.
    pub fn respawn(&self, run_at: DateTime<Utc>) -> Self {
        Self {
            kind: self.kind.clone(),
            repo_guid: self.repo_guid.clone(),
            plan_id: self.plan_id.clone(),
            priority: self.priority,
            flow_id: None,
            run_at,
            schedule: self.schedule.clone(),
            op_id: None,
            done: None,
        }
    }

    /// Display name, e.g. `backup[plan=daily]`.
    pub fn name(&self) -> String {
        if self.plan_id.is_empty() {
            self.kind.name().to_string()
        } else {
            format!("{}[plan={}]", self.kind.name(), self.plan_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_wires_completion_channel() {
        let task = Task::new(
            TaskKind::Backup { plan_id: "p".into() },
            "guid",
            "p",
            Utc::now(),
        );
        let (task, mut rx) = task.interactive();
        assert_eq!(task.priority, PRIORITY_INTERACTIVE);

        task.done.unwrap().send(Ok(42)).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), 42);
    }

    #[test]
    fn respawn_drops_interactive_state() {
        let task = Task::new(
            TaskKind::Backup { plan_id: "p".into() },
            "guid",
            "p",
            Utc::now(),
        );
        let (mut task, _rx) = task.interactive();
        task.op_id = Some(7);
        task.flow_id = Some(3);

        let next = task.respawn(Utc::now());
        assert!(next.done.is_none());
        assert!(next.op_id.is_none());
        assert!(next.flow_id.is_none());
        assert_eq!(next.kind, task.kind);
    }

    #[test]
    fn task_names() {
        let task = Task::new(
            TaskKind::Backup { plan_id: "daily".into() },
            "guid",
            "daily",
            Utc::now(),
        );
        assert_eq!(task.name(), "backup[plan=daily]");

        let gc = Task::new(TaskKind::CollectGarbage, "", "", Utc::now());
        assert_eq!(gc.name(), "collect_garbage");
    }
}
