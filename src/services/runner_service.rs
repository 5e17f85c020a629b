//! The task runner: turns a scheduled task into operation records.
//!
//! For each execution the runner creates (or resumes) the operation record,
//! opens a log store writer, flips the record to IN_PROGRESS, drives the
//! repo driver while throttling progress heartbeats, fires hook conditions
//! synchronously, and finalizes the record. Follow-up tasks (a backup's
//! forget pass) are returned to the scheduler, never enqueued directly.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::hook::{Hook, HookCondition};
use crate::models::operation::{
    BackupProgress, Operation, OperationPayload, OperationStatus, SnapshotMeta,
};
use crate::models::plan::Plan;
use crate::models::repo::Repo;
use crate::services::config_service::ConfigManager;
use crate::services::hook_service::{HookContext, HookExecutor, HookOutcome};
use crate::services::logstore_service::LogStore;
use crate::services::oplog_service::{OpLog, OpSelector};
use crate::services::restic_service::{ProgressEvent, ResticClient};
use crate::services::tasks::{Task, TaskKind};

/// Minimum wall time between persisted progress heartbeats.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Terminal operations older than this are collected by the garbage task.
const OP_RETENTION_DAYS: i64 = 90;

/// Grace window before an unreferenced log store ref is swept.
const LOGREF_GRACE: Duration = Duration::from_secs(24 * 3600);

/// Maximum length of `display_message`; longer errors are cut mid-way.
const DISPLAY_MESSAGE_LIMIT: usize = 1024;

/// Registry of in-flight executions, keyed by operation id. Shared between
/// the scheduler (which cancels) and the runner (which registers).
#[derive(Default)]
pub struct RunningOps {
    inner: Mutex<HashMap<i64, RunningOp>>,
}

#[derive(Clone)]
pub struct RunningOp {
    pub token: CancellationToken,
    pub repo_guid: String,
    pub plan_id: String,
}

impl RunningOps {
    pub fn register(&self, op_id: i64, entry: RunningOp) {
        self.inner.lock().expect("running ops lock").insert(op_id, entry);
    }

    pub fn unregister(&self, op_id: i64) {
        self.inner.lock().expect("running ops lock").remove(&op_id);
    }

    pub fn contains(&self, op_id: i64) -> bool {
        self.inner.lock().expect("running ops lock").contains_key(&op_id)
    }

    /// Cancel the execution claiming this operation, if any.
    pub fn cancel(&self, op_id: i64) -> bool {
        let guard = self.inner.lock().expect("running ops lock");
        match guard.get(&op_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every execution whose target satisfies the predicate; returns
    /// the cancelled tokens so callers can await drain.
    pub fn cancel_matching(&self, mut pred: impl FnMut(&RunningOp) -> bool) -> usize {
        let guard = self.inner.lock().expect("running ops lock");
        let mut count = 0;
        for entry in guard.values() {
            if pred(entry) {
                entry.token.cancel();
                count += 1;
            }
        }
        count
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(|_| true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("running ops lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an execution hands back to the scheduler.
#[derive(Debug, Default)]
pub struct TaskOutput {
    pub followups: Vec<Task>,
    /// Set when a RETRY hook policy asks for the task to be requeued; the
    /// operation stays PENDING.
    pub retry_after: Option<Duration>,
}

impl TaskOutput {
    fn done() -> Self {
        Self::default()
    }

    fn retry(after: Duration) -> Self {
        Self {
            followups: Vec::new(),
            retry_after: Some(after),
        }
    }
}

/// Executes tasks against the operation log, log store, and repo driver.
pub struct TaskRunner {
    oplog: Arc<OpLog>,
    logstore: LogStore,
    config: Arc<ConfigManager>,
    binary: PathBuf,
    clock: Arc<dyn Clock>,
    hooks: HookExecutor,
    running: Arc<RunningOps>,
}

impl TaskRunner {
    pub fn new(
        oplog: Arc<OpLog>,
        logstore: LogStore,
        config: Arc<ConfigManager>,
        binary: PathBuf,
        clock: Arc<dyn Clock>,
        running: Arc<RunningOps>,
    ) -> Self {
        Self {
            oplog,
            logstore,
            config,
            binary,
            clock,
            hooks: HookExecutor::new(),
            running,
        }
    }

    /// Execute one task to completion (or retry). Individual failures are
    /// recorded on the operation; an `Err` from here means the record
    /// itself could not be maintained.
    pub async fn execute(&self, task: &mut Task, cancel: CancellationToken) -> Result<TaskOutput> {
        tracing::info!(task = %task.name(), "executing task");
        match task.kind.clone() {
            TaskKind::Backup { plan_id } => self.run_backup(task, &plan_id, &cancel).await,
            TaskKind::Forget {
                plan_id,
                snapshot_id,
            } => {
                self.run_forget(task, &plan_id, snapshot_id.as_deref(), &cancel)
                    .await
            }
            TaskKind::Prune { repo_id } => self.run_prune(task, &repo_id, &cancel).await,
            TaskKind::Check { repo_id } => self.run_check(task, &repo_id, &cancel).await,
            TaskKind::IndexSnapshots { repo_id } => {
                self.run_index_snapshots(task, &repo_id).await
            }
            TaskKind::Restore {
                repo_id,
                plan_id,
                snapshot_id,
                path,
                target,
            } => {
                self.run_restore(task, &repo_id, &plan_id, &snapshot_id, path.as_deref(), &target, &cancel)
                    .await
            }
            TaskKind::Stats { repo_id } => self.run_stats(task, &repo_id).await,
            TaskKind::CollectGarbage => self.run_collect_garbage(task).await,
            TaskKind::RunCommand { repo_id, command } => {
                self.run_command(task, &repo_id, &command, &cancel).await
            }
        }
    }

    fn client(&self, repo: &Repo) -> ResticClient {
        ResticClient::new(&self.binary, repo.clone())
    }

    fn lookup_plan(&self, plan_id: &str) -> Result<(Plan, Repo)> {
        let cfg = self.config.get();
        let plan = cfg
            .plan(plan_id)
            .ok_or_else(|| AppError::NotFound(format!("plan \"{}\"", plan_id)))?
            .clone();
        let repo = cfg
            .repo_for_plan(&plan)
            .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", plan.repo)))?
            .clone();
        Ok((plan, repo))
    }

    fn lookup_repo(&self, repo_id: &str) -> Result<Repo> {
        self.config
            .get()
            .repo(repo_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("repo \"{}\"", repo_id)))
    }

    /// Plan hooks run before repo hooks, each set in declared order.
    fn merged_hooks(plan: Option<&Plan>, repo: &Repo) -> Vec<Hook> {
        let mut hooks = Vec::new();
        if let Some(plan) = plan {
            hooks.extend(plan.hooks.iter().cloned());
        }
        hooks.extend(repo.hooks.iter().cloned());
        hooks
    }

    /// Create the operation for a task, or resume the one a RETRY requeue
    /// left PENDING. Returns `None` when the resumed operation was
    /// cancelled while waiting.
    async fn create_or_resume_op(
        &self,
        task: &mut Task,
        repo: &Repo,
        plan_id: &str,
        payload: OperationPayload,
    ) -> Result<Option<Operation>> {
        if let Some(op_id) = task.op_id {
            let op = self.oplog.get(op_id).await?;
            if op.status != OperationStatus::Pending {
                return Ok(None);
            }
            return Ok(Some(op));
        }

        let mut op = Operation::new(
            self.oplog.instance_id(),
            &repo.id,
            &repo.guid,
            plan_id,
            self.clock.now_utc(),
            payload,
        );
        if let Some(flow) = task.flow_id {
            op.flow_id = flow;
        }
        self.oplog.add(&mut op).await?;
        task.op_id = Some(op.id);
        Ok(Some(op))
    }

    async fn finalize(
        &self,
        op: &mut Operation,
        status: OperationStatus,
        message: impl Into<String>,
    ) -> Result<()> {
        op.display_message = truncate_message(&message.into());
        op.finalize(status, self.clock.now_utc());
        self.oplog.update(op).await
    }

    /// Send the interactive completion, if any.
    fn complete(task: &mut Task, result: std::result::Result<i64, String>) {
        if let Some(done) = task.done.take() {
            let _ = done.send(result);
        }
    }

    fn hook_ctx(&self, condition: HookCondition, op: &Operation, error: &str) -> HookContext {
        let (summary_json, size_bytes) = match &op.payload {
            OperationPayload::Backup {
                summary: Some(summary),
                ..
            } => (
                serde_json::to_string(summary).unwrap_or_default(),
                summary.data_added,
            ),
            _ => (String::new(), 0),
        };
        let now = self.clock.now_utc();
        HookContext {
            event: condition.to_string(),
            repo_id: op.repo_id.clone(),
            plan_id: op.plan_id.clone(),
            snapshot_id: op.snapshot_id.clone(),
            error: error.to_string(),
            summary: summary_json,
            start_time: op.start_time().to_rfc3339(),
            duration_ms: now.timestamp_millis() - op.unix_time_start_ms,
            size_bytes,
        }
    }

    async fn fire_hooks(
        &self,
        condition: HookCondition,
        hooks: &[Hook],
        op: &Operation,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<HookOutcome> {
        let ctx = self.hook_ctx(condition, op, error);
        self.hooks
            .fire(condition, hooks, &ctx, op, &self.oplog, &self.logstore, cancel)
            .await
    }

    /// Apply the outcome of a guarding hook condition. Returns `Some` when
    /// the task must stop here.
    async fn apply_guard_outcome(
        &self,
        outcome: HookOutcome,
        task: &mut Task,
        op: &mut Operation,
    ) -> Result<Option<TaskOutput>> {
        match outcome {
            HookOutcome::Continue => Ok(None),
            HookOutcome::Cancel => {
                self.finalize(op, OperationStatus::UserCancelled, "cancelled by hook")
                    .await?;
                Self::complete(task, Err("cancelled by hook".into()));
                Ok(Some(TaskOutput::done()))
            }
            HookOutcome::Fatal => {
                self.emit_hook_warning(op).await?;
                self.finalize(op, OperationStatus::Error, "aborted by failing hook")
                    .await?;
                Self::complete(task, Err("aborted by failing hook".into()));
                Ok(Some(TaskOutput::done()))
            }
            HookOutcome::Retry(delay) => {
                op.status = OperationStatus::Pending;
                self.oplog.update(op).await?;
                tracing::info!(
                    op = op.id,
                    delay_secs = delay.as_secs(),
                    "task requeued by hook retry policy"
                );
                Ok(Some(TaskOutput::retry(delay)))
            }
        }
    }

    /// A FATAL hook emits an additional warning record alongside the failed
    /// task operation.
    async fn emit_hook_warning(&self, base: &Operation) -> Result<()> {
        let mut warning = Operation::new(
            self.oplog.instance_id(),
            &base.repo_id,
            &base.repo_guid,
            &base.plan_id,
            self.clock.now_utc(),
            OperationPayload::RunHook {
                name: "fatal-hook".into(),
                condition: HookCondition::AnyError.to_string(),
                exit_code: 0,
            },
        );
        warning.flow_id = base.flow_id;
        warning.display_message = "task aborted by a hook with FATAL policy".into();
        warning.status = OperationStatus::Warning;
        warning.unix_time_end_ms = warning.unix_time_start_ms;
        self.oplog.add(&mut warning).await
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    async fn run_backup(
        &self,
        task: &mut Task,
        plan_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let (plan, repo) = self.lookup_plan(plan_id)?;
        let Some(mut op) = self
            .create_or_resume_op(task, &repo, plan_id, OperationPayload::new_backup())
            .await?
        else {
            Self::complete(task, Err("operation no longer pending".into()));
            return Ok(TaskOutput::done());
        };

        self.running.register(
            op.id,
            RunningOp {
                token: cancel.clone(),
                repo_guid: repo.guid.clone(),
                plan_id: plan.id.clone(),
            },
        );
        let result = self.backup_inner(task, &mut op, &plan, &repo, cancel).await;
        self.running.unregister(op.id);

        match &result {
            Ok(output) if output.retry_after.is_none() => {
                let message = match op.status {
                    OperationStatus::Success | OperationStatus::Warning => Ok(op.id),
                    other => Err(format!("backup finished as {}", other)),
                };
                Self::complete(task, message);
            }
            Ok(_) => {} // retry keeps the completion channel pending
            Err(e) => Self::complete(task, Err(e.to_string())),
        }
        result
    }

    async fn backup_inner(
        &self,
        task: &mut Task,
        op: &mut Operation,
        plan: &Plan,
        repo: &Repo,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let (mut writer, logref) = self.logstore.create().await?;
        op.logref = logref;
        op.status = OperationStatus::InProgress;
        self.oplog.update(op).await?;

        let hooks = Self::merged_hooks(Some(plan), repo);
        let outcome = self
            .fire_hooks(HookCondition::SnapshotStart, &hooks, op, "", cancel)
            .await?;
        if let Some(stop) = self.apply_guard_outcome(outcome, task, op).await? {
            writer.finalize().await?;
            return Ok(stop);
        }

        if cancel.is_cancelled() {
            self.finalize(op, OperationStatus::UserCancelled, "cancelled before backup started")
                .await?;
            writer.finalize().await?;
            return Ok(TaskOutput::done());
        }

        let client = self.client(repo);
        if repo.auto_unlock {
            if let Err(e) = client.unlock(None).await {
                tracing::warn!(repo = %repo.id, error = %e, "auto-unlock failed");
            }
        }

        // Progress heartbeats persist at most every PROGRESS_INTERVAL.
        let latest: Arc<Mutex<Option<BackupProgress>>> = Arc::new(Mutex::new(None));
        let updater = {
            let oplog = Arc::clone(&self.oplog);
            let latest = Arc::clone(&latest);
            let mut heartbeat_op = op.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let status = latest.lock().expect("progress lock").take();
                    if let Some(status) = status {
                        if let OperationPayload::Backup { last_status, .. } =
                            &mut heartbeat_op.payload
                        {
                            *last_status = Some(status);
                        }
                        if oplog.update(&mut heartbeat_op).await.is_err() {
                            break;
                        }
                    }
                }
            })
        };

        let tags = vec![
            format!("plan:{}", plan.id),
            format!("created-by:{}", self.oplog.instance_id()),
        ];
        let backup_result = client
            .backup(
                &plan.paths,
                &plan.excludes,
                &plan.iexcludes,
                &tags,
                cancel,
                Some(&mut writer),
                |event| {
                    if let ProgressEvent::Status(status) = event {
                        *latest.lock().expect("progress lock") = Some(status);
                    }
                },
            )
            .await;
        // The heartbeat task must be fully stopped before the final update,
        // or a late heartbeat could resurrect a terminal operation.
        updater.abort();
        let _ = updater.await;

        let output = match backup_result {
            Ok(report) => {
                op.snapshot_id = report.summary.snapshot_id.clone();
                let status = if report.errors.is_empty() {
                    OperationStatus::Success
                } else {
                    OperationStatus::Warning
                };
                let snapshot_meta = SnapshotMeta {
                    id: report.summary.snapshot_id.clone(),
                    unix_time_ms: self.clock.now_utc().timestamp_millis(),
                    tags: tags.clone(),
                    paths: plan.paths.clone(),
                };
                op.payload = OperationPayload::Backup {
                    last_status: None,
                    summary: Some(report.summary),
                    errors: report.errors,
                };
                self.finalize(op, status, "").await?;

                self.index_snapshot_in_flow(op, snapshot_meta).await?;

                let mut followups = Vec::new();
                if plan.retention.to_forget_args().is_some() {
                    followups.push(
                        Task::new(
                            TaskKind::Forget {
                                plan_id: plan.id.clone(),
                                snapshot_id: None,
                            },
                            &repo.guid,
                            &plan.id,
                            self.clock.now_utc(),
                        )
                        .in_flow(op.flow_id),
                    );
                }

                let success_condition = if status == OperationStatus::Warning {
                    HookCondition::SnapshotWarningError
                } else {
                    HookCondition::SnapshotSuccess
                };
                let _ = self
                    .fire_hooks(success_condition, &hooks, op, "", cancel)
                    .await?;
                let _ = self
                    .fire_hooks(HookCondition::SnapshotEnd, &hooks, op, "", cancel)
                    .await?;

                TaskOutput {
                    followups,
                    retry_after: None,
                }
            }
            Err(AppError::Cancelled) => {
                self.finalize(op, OperationStatus::Error, "cancelled while backup was running")
                    .await?;
                let _ = self
                    .fire_hooks(
                        HookCondition::SnapshotEnd,
                        &hooks,
                        op,
                        "",
                        &CancellationToken::new(),
                    )
                    .await?;
                TaskOutput::done()
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(op, OperationStatus::Error, message.clone()).await?;
                let _ = self
                    .fire_hooks(HookCondition::SnapshotError, &hooks, op, &message, cancel)
                    .await?;
                let _ = self
                    .fire_hooks(HookCondition::AnyError, &hooks, op, &message, cancel)
                    .await?;
                let _ = self
                    .fire_hooks(HookCondition::SnapshotEnd, &hooks, op, &message, cancel)
                    .await?;
                TaskOutput::done()
            }
        };

        writer.finalize().await?;
        Ok(output)
    }

    /// Record the snapshot a successful backup produced, in the same flow.
    async fn index_snapshot_in_flow(&self, backup_op: &Operation, meta: SnapshotMeta) -> Result<()> {
        let mut index_op = Operation::new(
            self.oplog.instance_id(),
            &backup_op.repo_id,
            &backup_op.repo_guid,
            &backup_op.plan_id,
            self.clock.now_utc(),
            OperationPayload::IndexSnapshot {
                snapshot: meta.clone(),
                forgot: false,
            },
        );
        index_op.flow_id = backup_op.flow_id;
        index_op.snapshot_id = meta.id;
        index_op.status = OperationStatus::Success;
        index_op.unix_time_end_ms = index_op.unix_time_start_ms;
        self.oplog.add(&mut index_op).await
    }

    // -----------------------------------------------------------------------
    // Forget
    // -----------------------------------------------------------------------

    async fn run_forget(
        &self,
        task: &mut Task,
        plan_id: &str,
        snapshot_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let (plan, repo) = self.lookup_plan(plan_id)?;
        let policy_json = match snapshot_id {
            Some(id) => format!(r#"{{"snapshot":"{}"}}"#, id),
            None => serde_json::to_string(&plan.retention)?,
        };
        let Some(mut op) = self
            .create_or_resume_op(
                task,
                &repo,
                plan_id,
                OperationPayload::Forget {
                    removed: Vec::new(),
                    policy_json,
                },
            )
            .await?
        else {
            return Ok(TaskOutput::done());
        };

        self.running.register(
            op.id,
            RunningOp {
                token: cancel.clone(),
                repo_guid: repo.guid.clone(),
                plan_id: plan.id.clone(),
            },
        );

        let (mut writer, logref) = self.logstore.create().await?;
        op.logref = logref;
        op.status = OperationStatus::InProgress;
        self.oplog.update(&mut op).await?;

        let client = self.client(&repo);
        let result = match snapshot_id {
            Some(id) => {
                // Targeted forget of one snapshot; the tool reports nothing
                // back, so look the metadata up first.
                let meta = client
                    .snapshots(None)
                    .await
                    .ok()
                    .and_then(|s| s.into_iter().find(|s| s.id == id));
                client
                    .forget_snapshots(&[id.to_string()], Some(&mut writer))
                    .await
                    .map(|()| meta.into_iter().collect::<Vec<_>>())
            }
            None => match plan.retention.to_forget_args() {
                None => Ok(Vec::new()),
                Some(args) => {
                    client
                        .forget(&args, Some(&format!("plan:{}", plan.id)), Some(&mut writer))
                        .await
                }
            },
        };

        let output = match result {
            Ok(removed) => {
                let removed_meta: Vec<SnapshotMeta> =
                    removed.iter().map(|s| s.to_meta()).collect();
                for snapshot in &removed {
                    self.mark_snapshot_forgotten(&repo.guid, &snapshot.id).await?;
                }
                if let OperationPayload::Forget { removed, .. } = &mut op.payload {
                    *removed = removed_meta;
                }
                self.finalize(&mut op, OperationStatus::Success, "").await?;
                Self::complete(task, Ok(op.id));
                TaskOutput::done()
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(&mut op, OperationStatus::Error, message.clone())
                    .await?;
                let hooks = Self::merged_hooks(Some(&plan), &repo);
                let _ = self
                    .fire_hooks(HookCondition::AnyError, &hooks, &op, &message, cancel)
                    .await?;
                Self::complete(task, Err(message));
                TaskOutput::done()
            }
        };

        writer.finalize().await?;
        self.running.unregister(op.id);
        Ok(output)
    }

    /// Flip the `forgot` marker on the indexed operation for a removed
    /// snapshot.
    async fn mark_snapshot_forgotten(&self, repo_guid: &str, snapshot_id: &str) -> Result<()> {
        let selector = OpSelector {
            repo_guid: Some(repo_guid.to_string()),
            snapshot_id: Some(snapshot_id.to_string()),
            kinds: Some(vec!["index_snapshot".into()]),
            ..Default::default()
        };
        self.oplog
            .transform(&selector, |mut op| {
                if let OperationPayload::IndexSnapshot { forgot, .. } = &mut op.payload {
                    *forgot = true;
                }
                Some(op)
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Prune / Check
    // -----------------------------------------------------------------------

    async fn run_prune(
        &self,
        task: &mut Task,
        repo_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let repo = self.lookup_repo(repo_id)?;
        let Some(mut op) = self
            .create_or_resume_op(
                task,
                &repo,
                "",
                OperationPayload::Prune {
                    output_logref: String::new(),
                },
            )
            .await?
        else {
            return Ok(TaskOutput::done());
        };

        self.running.register(
            op.id,
            RunningOp {
                token: cancel.clone(),
                repo_guid: repo.guid.clone(),
                plan_id: String::new(),
            },
        );

        let (mut writer, logref) = self.logstore.create().await?;
        op.logref = logref.clone();
        if let OperationPayload::Prune { output_logref } = &mut op.payload {
            *output_logref = logref;
        }
        op.status = OperationStatus::InProgress;
        self.oplog.update(&mut op).await?;

        let hooks = Self::merged_hooks(None, &repo);
        let outcome = self
            .fire_hooks(HookCondition::PruneStart, &hooks, &op, "", cancel)
            .await?;
        if let Some(stop) = self.apply_guard_outcome(outcome, task, &mut op).await? {
            writer.finalize().await?;
            self.running.unregister(op.id);
            return Ok(stop);
        }

        let client = self.client(&repo);
        if repo.auto_unlock {
            if let Err(e) = client.unlock(None).await {
                tracing::warn!(repo = %repo.id, error = %e, "auto-unlock failed");
            }
        }
        let result = client
            .prune(repo.prune_policy.max_unused_percent, cancel, Some(&mut writer))
            .await;

        match result {
            Ok(()) => {
                self.finalize(&mut op, OperationStatus::Success, "").await?;
                Self::complete(task, Ok(op.id));
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(&mut op, OperationStatus::Error, message.clone())
                    .await?;
                let _ = self
                    .fire_hooks(HookCondition::AnyError, &hooks, &op, &message, cancel)
                    .await?;
                Self::complete(task, Err(message));
            }
        }
        let _ = self
            .fire_hooks(HookCondition::PruneEnd, &hooks, &op, "", cancel)
            .await?;

        writer.finalize().await?;
        self.running.unregister(op.id);
        Ok(TaskOutput::done())
    }

    async fn run_check(
        &self,
        task: &mut Task,
        repo_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let repo = self.lookup_repo(repo_id)?;
        let Some(mut op) = self
            .create_or_resume_op(
                task,
                &repo,
                "",
                OperationPayload::Check {
                    output_logref: String::new(),
                },
            )
            .await?
        else {
            return Ok(TaskOutput::done());
        };

        self.running.register(
            op.id,
            RunningOp {
                token: cancel.clone(),
                repo_guid: repo.guid.clone(),
                plan_id: String::new(),
            },
        );

        let (mut writer, logref) = self.logstore.create().await?;
        op.logref = logref.clone();
        if let OperationPayload::Check { output_logref } = &mut op.payload {
            *output_logref = logref;
        }
        op.status = OperationStatus::InProgress;
        self.oplog.update(&mut op).await?;

        let hooks = Self::merged_hooks(None, &repo);
        let outcome = self
            .fire_hooks(HookCondition::CheckStart, &hooks, &op, "", cancel)
            .await?;
        if let Some(stop) = self.apply_guard_outcome(outcome, task, &mut op).await? {
            writer.finalize().await?;
            self.running.unregister(op.id);
            return Ok(stop);
        }

        let client = self.client(&repo);
        let result = client
            .check(repo.check_policy.read_data_percent, cancel, Some(&mut writer))
            .await;

        match result {
            Ok(()) => {
                self.finalize(&mut op, OperationStatus::Success, "").await?;
                Self::complete(task, Ok(op.id));
            }
            Err(e) => {
                // Data integrity problems surface as WARNING_ERROR so
                // notifier hooks can page; the repo is not quarantined.
                let message = e.to_string();
                self.finalize(&mut op, OperationStatus::Error, message.clone())
                    .await?;
                let _ = self
                    .fire_hooks(
                        HookCondition::SnapshotWarningError,
                        &hooks,
                        &op,
                        &message,
                        cancel,
                    )
                    .await?;
                let _ = self
                    .fire_hooks(HookCondition::AnyError, &hooks, &op, &message, cancel)
                    .await?;
                Self::complete(task, Err(message));
            }
        }
        let _ = self
            .fire_hooks(HookCondition::CheckEnd, &hooks, &op, "", cancel)
            .await?;

        writer.finalize().await?;
        self.running.unregister(op.id);
        Ok(TaskOutput::done())
    }

    // -----------------------------------------------------------------------
    // Snapshot indexing
    // -----------------------------------------------------------------------

    async fn run_index_snapshots(&self, task: &mut Task, repo_id: &str) -> Result<TaskOutput> {
        let repo = self.lookup_repo(repo_id)?;
        let client = self.client(&repo);
        let snapshots = match client.snapshots(None).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                Self::complete(task, Err(e.to_string()));
                return Err(e);
            }
        };

        let indexed = self
            .oplog
            .query(&OpSelector {
                repo_guid: Some(repo.guid.clone()),
                kinds: Some(vec!["index_snapshot".into()]),
                ..Default::default()
            })
            .await?;
        let known: HashSet<String> = indexed.iter().map(|op| op.snapshot_id.clone()).collect();

        let mut added = 0u64;
        for snapshot in &snapshots {
            if known.contains(&snapshot.id) {
                continue;
            }
            // Attribute the snapshot to the instance and plan that made it.
            let instance = snapshot
                .tag_value("created-by")
                .unwrap_or_else(|| self.oplog.instance_id());
            let plan_id = snapshot.tag_value("plan").unwrap_or("");
            let mut op = Operation::new(
                instance,
                &repo.id,
                &repo.guid,
                plan_id,
                self.clock.now_utc(),
                OperationPayload::IndexSnapshot {
                    snapshot: snapshot.to_meta(),
                    forgot: false,
                },
            );
            op.snapshot_id = snapshot.id.clone();
            op.status = OperationStatus::Success;
            op.unix_time_end_ms = op.unix_time_start_ms;
            self.oplog.add(&mut op).await?;
            added += 1;
        }

        // Mark snapshots that vanished from the repo as forgotten.
        let current: HashSet<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        let selector = OpSelector {
            repo_guid: Some(repo.guid.clone()),
            kinds: Some(vec!["index_snapshot".into()]),
            ..Default::default()
        };
        self.oplog
            .transform(&selector, |mut op| {
                if !current.contains(op.snapshot_id.as_str()) {
                    if let OperationPayload::IndexSnapshot { forgot, .. } = &mut op.payload {
                        *forgot = true;
                    }
                }
                Some(op)
            })
            .await?;

        tracing::debug!(repo = %repo.id, added, "snapshot index reconciled");
        Self::complete(task, Ok(0));
        Ok(TaskOutput::done())
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_restore(
        &self,
        task: &mut Task,
        repo_id: &str,
        plan_id: &str,
        snapshot_id: &str,
        path: Option<&str>,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let repo = self.lookup_repo(repo_id)?;
        let Some(mut op) = self
            .create_or_resume_op(
                task,
                &repo,
                plan_id,
                OperationPayload::Restore {
                    snapshot_id: snapshot_id.to_string(),
                    path: path.unwrap_or("").to_string(),
                    target: target.to_string(),
                    last_status: None,
                },
            )
            .await?
        else {
            return Ok(TaskOutput::done());
        };
        op.snapshot_id = snapshot_id.to_string();

        self.running.register(
            op.id,
            RunningOp {
                token: cancel.clone(),
                repo_guid: repo.guid.clone(),
                plan_id: plan_id.to_string(),
            },
        );

        let (mut writer, logref) = self.logstore.create().await?;
        op.logref = logref;
        op.status = OperationStatus::InProgress;
        self.oplog.update(&mut op).await?;

        let client = self.client(&repo);
        let result = client
            .restore(snapshot_id, path, target, cancel, Some(&mut writer), |_| {})
            .await;

        match result {
            Ok(()) => {
                self.finalize(&mut op, OperationStatus::Success, "").await?;
                Self::complete(task, Ok(op.id));
            }
            Err(AppError::Cancelled) => {
                self.finalize(&mut op, OperationStatus::UserCancelled, "restore cancelled")
                    .await?;
                Self::complete(task, Err("restore cancelled".into()));
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(&mut op, OperationStatus::Error, message.clone())
                    .await?;
                Self::complete(task, Err(message));
            }
        }

        writer.finalize().await?;
        self.running.unregister(op.id);
        Ok(TaskOutput::done())
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    async fn run_stats(&self, task: &mut Task, repo_id: &str) -> Result<TaskOutput> {
        let repo = self.lookup_repo(repo_id)?;
        let Some(mut op) = self
            .create_or_resume_op(
                task,
                &repo,
                "",
                OperationPayload::Stats {
                    total_size: 0,
                    total_file_count: 0,
                    snapshot_count: 0,
                },
            )
            .await?
        else {
            return Ok(TaskOutput::done());
        };
        op.status = OperationStatus::InProgress;
        self.oplog.update(&mut op).await?;

        let client = self.client(&repo);
        match client.stats(None).await {
            Ok(stats) => {
                let snapshot_count = if stats.snapshot_count > 0 {
                    stats.snapshot_count
                } else {
                    client.snapshots(None).await.map(|s| s.len() as u64).unwrap_or(0)
                };
                op.payload = OperationPayload::Stats {
                    total_size: stats.total_size,
                    total_file_count: stats.total_file_count,
                    snapshot_count,
                };
                self.finalize(&mut op, OperationStatus::Success, "").await?;
                Self::complete(task, Ok(op.id));
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(&mut op, OperationStatus::Error, message.clone())
                    .await?;
                Self::complete(task, Err(message));
            }
        }
        Ok(TaskOutput::done())
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    async fn run_collect_garbage(&self, task: &mut Task) -> Result<TaskOutput> {
        let now = self.clock.now_utc();
        let horizon = now - chrono::Duration::days(OP_RETENTION_DAYS);

        // Snapshot index records are kept as long as the snapshot may
        // exist; everything else ages out.
        let selector = OpSelector {
            started_before_ms: Some(horizon.timestamp_millis()),
            statuses: Some(vec![
                OperationStatus::Success,
                OperationStatus::Error,
                OperationStatus::Warning,
                OperationStatus::UserCancelled,
                OperationStatus::SystemCancelled,
            ]),
            kinds: Some(vec![
                "backup".into(),
                "forget".into(),
                "prune".into(),
                "check".into(),
                "stats".into(),
                "restore".into(),
                "run_hook".into(),
                "run_command".into(),
            ]),
            ..Default::default()
        };
        let deleted = self.oplog.delete(&selector).await?;

        let mut live: HashSet<String> = HashSet::new();
        self.oplog
            .for_each(&OpSelector::all(), |op| {
                if !op.logref.is_empty() {
                    live.insert(op.logref.clone());
                }
                match &op.payload {
                    OperationPayload::Prune { output_logref }
                    | OperationPayload::Check { output_logref }
                    | OperationPayload::RunCommand { output_logref, .. } => {
                        if !output_logref.is_empty() {
                            live.insert(output_logref.clone());
                        }
                    }
                    _ => {}
                }
                std::ops::ControlFlow::Continue(())
            })
            .await?;
        let swept = self.logstore.sweep(&live, LOGREF_GRACE, now).await?;

        if deleted > 0 || swept > 0 {
            tracing::info!(deleted, swept, "garbage collection pass complete");
        }
        Self::complete(task, Ok(0));
        Ok(TaskOutput::done())
    }

    // -----------------------------------------------------------------------
    // Ad-hoc commands
    // -----------------------------------------------------------------------

    async fn run_command(
        &self,
        task: &mut Task,
        repo_id: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let repo = self.lookup_repo(repo_id)?;
        let Some(mut op) = self
            .create_or_resume_op(
                task,
                &repo,
                "",
                OperationPayload::RunCommand {
                    command: command.to_string(),
                    output_logref: String::new(),
                },
            )
            .await?
        else {
            return Ok(TaskOutput::done());
        };

        self.running.register(
            op.id,
            RunningOp {
                token: cancel.clone(),
                repo_guid: repo.guid.clone(),
                plan_id: String::new(),
            },
        );

        let (mut writer, logref) = self.logstore.create().await?;
        op.logref = logref.clone();
        if let OperationPayload::RunCommand { output_logref, .. } = &mut op.payload {
            *output_logref = logref;
        }
        op.status = OperationStatus::InProgress;
        self.oplog.update(&mut op).await?;

        let client = self.client(&repo);
        match client.run_command(command, cancel, Some(&mut writer)).await {
            Ok(()) => {
                self.finalize(&mut op, OperationStatus::Success, "").await?;
                Self::complete(task, Ok(op.id));
            }
            Err(AppError::Cancelled) => {
                self.finalize(&mut op, OperationStatus::UserCancelled, "command cancelled")
                    .await?;
                Self::complete(task, Err("command cancelled".into()));
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(&mut op, OperationStatus::Error, message.clone())
                    .await?;
                Self::complete(task, Err(message));
            }
        }

        writer.finalize().await?;
        self.running.unregister(op.id);
        Ok(TaskOutput::done())
    }
}

/// Cut overly long error text for `display_message`, keeping head and tail.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= DISPLAY_MESSAGE_LIMIT {
        return message.to_string();
    }
    let half = DISPLAY_MESSAGE_LIMIT / 2;
    let head_end = (0..=half).rev().find(|i| message.is_char_boundary(*i)).unwrap_or(0);
    let tail_start = (message.len() - half..message.len())
        .find(|i| message.is_char_boundary(*i))
        .unwrap_or(message.len());
    format!("{}...{}", &message[..head_end], &message[tail_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_ops_cancel_by_id() {
        let running = RunningOps::default();
        let token = CancellationToken::new();
        running.register(
            7,
            RunningOp {
                token: token.clone(),
                repo_guid: "guid".into(),
                plan_id: "p".into(),
            },
        );

        assert!(running.contains(7));
        assert!(running.cancel(7));
        assert!(token.is_cancelled());
        assert!(!running.cancel(8));

        running.unregister(7);
        assert!(running.is_empty());
    }

    #[test]
    fn running_ops_cancel_matching_targets() {
        let running = RunningOps::default();
        let keep = CancellationToken::new();
        let drop_token = CancellationToken::new();
        running.register(
            1,
            RunningOp {
                token: keep.clone(),
                repo_guid: "guid-a".into(),
                plan_id: "p1".into(),
            },
        );
        running.register(
            2,
            RunningOp {
                token: drop_token.clone(),
                repo_guid: "guid-b".into(),
                plan_id: "p2".into(),
            },
        );

        let cancelled = running.cancel_matching(|entry| entry.repo_guid == "guid-b");
        assert_eq!(cancelled, 1);
        assert!(!keep.is_cancelled());
        assert!(drop_token.is_cancelled());
    }

    #[test]
    fn long_messages_are_truncated_head_and_tail() {
        let message = "x".repeat(5000);
        let truncated = truncate_message(&message);
        assert!(truncated.len() <= DISPLAY_MESSAGE_LIMIT + 3);
        assert!(truncated.contains("..."));

        let short = truncate_message("all fine");
        assert_eq!(short, "all fine");
    }
}
