//! The orchestrator: a single consumer loop over a min-heap of scheduled
//! tasks, with per-repo mutual exclusion and config-driven rebuilds.
//!
//! Tasks on distinct repos execute concurrently; tasks sharing a repo guid
//! are serialized by that repo's lock, acquired with a non-blocking try and
//! a short backoff requeue on contention. The runner is handed each task as
//! a capability; follow-up tasks flow back through the append-only queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, RetryPolicy};
use crate::error::Result;
use crate::models::config::Config;
use crate::models::operation::OperationStatus;
use crate::models::plan::{Schedule, ScheduleClock, SchedulePolicy};
use crate::services::config_service::ConfigManager;
use crate::services::logstore_service::LogStore;
use crate::services::oplog_service::OpLog;
use crate::services::runner_service::{RunningOps, TaskRunner};
use crate::services::tasks::{Task, TaskKind, PRIORITY_MAINTENANCE, PRIORITY_STATS};

/// Grace given to a cancelled task to finalize its own operation before the
/// scheduler rewrites it to SYSTEM_CANCELLED.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// How long the queue sleeps when it is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

struct HeapEntry {
    run_at: DateTime<Utc>,
    priority: i32,
    seq: u64,
    task: Task,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `BinaryHeap` is a max-heap: reverse the ordering so the earliest
/// run time (then best priority, then FIFO) pops first.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The scheduling core. Shared behind an `Arc`; `run` is the single
/// consumer loop.
pub struct Orchestrator {
    oplog: Arc<OpLog>,
    logstore: LogStore,
    config: Arc<ConfigManager>,
    binary: PathBuf,
    clock: Arc<dyn Clock>,
    queue: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
    repo_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    running: Arc<RunningOps>,
    executions: AtomicUsize,
    seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        oplog: Arc<OpLog>,
        logstore: LogStore,
        config: Arc<ConfigManager>,
        binary: PathBuf,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            oplog,
            logstore,
            config,
            binary,
            clock,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            repo_locks: Mutex::new(HashMap::new()),
            running: Arc::new(RunningOps::default()),
            executions: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        })
    }

    /// Enqueue a task for execution. Append-only: nothing already queued or
    /// running is affected.
    pub fn enqueue(&self, task: Task) {
        self.push(task);
        self.notify.notify_one();
    }

    fn push(&self, task: Task) {
        let entry = HeapEntry {
            run_at: task.run_at,
            priority: task.priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        self.queue.lock().expect("queue lock").push(entry);
    }

    fn repo_lock(&self, repo_guid: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.repo_locks.lock().expect("repo locks");
        Arc::clone(
            locks
                .entry(repo_guid.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// The main loop. Runs until `shutdown` is cancelled, then drains
    /// in-flight executions.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut config_rx = self.config.subscribe();
        let initial = config_rx.borrow_and_update().clone();
        self.rebuild(&initial).await;
        tracing::info!("orchestrator started");

        loop {
            let now = self.clock.now_utc();
            let sleep_for = {
                let queue = self.queue.lock().expect("queue lock");
                match queue.peek() {
                    Some(top) if top.run_at <= now => Duration::ZERO,
                    Some(top) => (top.run_at - now).to_std().unwrap_or(Duration::ZERO),
                    None => IDLE_SLEEP,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config_rx.changed() => {
                    if changed.is_ok() {
                        let cfg = config_rx.borrow_and_update().clone();
                        tracing::info!(modno = cfg.modno, "rebuilding task set from new config");
                        self.rebuild(&cfg).await;
                    }
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }

            self.dispatch_due();
        }

        tracing::info!("orchestrator shutting down, draining tasks");
        self.running.cancel_all();
        self.drain(Duration::from_secs(30)).await;
    }

    /// Pop and start everything that is due. Contended repos are requeued
    /// with a short backoff rather than blocking the loop.
    fn dispatch_due(self: &Arc<Self>) {
        let now = self.clock.now_utc();
        loop {
            let entry = {
                let mut queue = self.queue.lock().expect("queue lock");
                match queue.peek() {
                    Some(top) if top.run_at <= now => queue.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            let mut task = entry.task;

            let guard = if task.repo_guid.is_empty() {
                None
            } else {
                let lock = self.repo_lock(&task.repo_guid);
                match lock.try_lock_owned() {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        let backoff = RetryPolicy::lock_contention().delay_for(0);
                        task.run_at = now
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::milliseconds(250));
                        self.push(task);
                        continue;
                    }
                }
            };

            self.spawn_execution(task, guard);
        }
    }

    /// Run one task on its own tokio task, inside a recovery boundary:
    /// panics and runner errors are recorded, never propagated to the loop.
    fn spawn_execution(self: &Arc<Self>, mut task: Task, guard: Option<OwnedMutexGuard<()>>) {
        let this = Arc::clone(self);
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);

        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let runner = TaskRunner::new(
                Arc::clone(&this.oplog),
                this.logstore.clone(),
                Arc::clone(&this.config),
                this.binary.clone(),
                Arc::clone(&this.clock),
                Arc::clone(&this.running),
            );

            let result = std::panic::AssertUnwindSafe(runner.execute(&mut task, cancel.clone()))
                .catch_unwind()
                .await;
            drop(guard);

            match result {
                Ok(Ok(output)) => {
                    for followup in output.followups {
                        this.push(followup);
                    }
                    if let Some(delay) = output.retry_after {
                        task.run_at = this.clock.now_utc()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        this.push(task);
                    } else if let Some(schedule) = task.schedule.clone() {
                        let now = this.clock.now_utc();
                        if let Some(next) = schedule.next_after(now, Some(now)) {
                            this.push(task.respawn(next));
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(task = %task.name(), error = %e, "task execution failed");
                    if let Some(done) = task.done.take() {
                        let _ = done.send(Err(e.to_string()));
                    }
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| panic.downcast_ref::<&str>().copied())
                        .unwrap_or("task panicked");
                    tracing::error!(task = %task.name(), panic = message, "task panicked");
                    if let Some(op_id) = task.op_id {
                        this.running.unregister(op_id);
                        this.mark_operation_failed(op_id, message).await;
                    }
                    if let Some(done) = task.done.take() {
                        let _ = done.send(Err(message.to_string()));
                    }
                }
            }

            this.executions.fetch_sub(1, AtomicOrdering::SeqCst);
            this.notify.notify_one();
        });
    }

    async fn mark_operation_failed(&self, op_id: i64, message: &str) {
        if let Ok(mut op) = self.oplog.get(op_id).await {
            if !op.status.is_terminal() {
                op.display_message = crate::services::runner_service::truncate_message(message);
                op.finalize(OperationStatus::Error, self.clock.now_utc());
                let _ = self.oplog.update(&mut op).await;
            }
        }
    }

    /// Cancel the operation with the given id: running executions get their
    /// token cancelled with a finalization grace, queued ones are dropped.
    pub async fn cancel_operation(self: &Arc<Self>, op_id: i64) -> Result<()> {
        if self.running.cancel(op_id) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(CANCEL_GRACE).await;
                if let Ok(mut op) = this.oplog.get(op_id).await {
                    if !op.status.is_terminal() {
                        op.display_message = "cancellation grace deadline exceeded".into();
                        op.finalize(OperationStatus::SystemCancelled, this.clock.now_utc());
                        let _ = this.oplog.update(&mut op).await;
                        this.running.unregister(op_id);
                    }
                }
            });
            return Ok(());
        }

        // Not running: drop any queued task resuming this operation.
        {
            let mut queue = self.queue.lock().expect("queue lock");
            let entries = std::mem::take(&mut *queue);
            for mut entry in entries.into_iter() {
                if entry.task.op_id == Some(op_id) {
                    if let Some(done) = entry.task.done.take() {
                        let _ = done.send(Err("cancelled".into()));
                    }
                } else {
                    queue.push(entry);
                }
            }
        }

        let mut op = self.oplog.get(op_id).await?;
        if !op.status.is_terminal() {
            op.display_message = "cancelled by user".into();
            op.finalize(OperationStatus::UserCancelled, self.clock.now_utc());
            self.oplog.update(&mut op).await?;
        }
        Ok(())
    }

    /// Diff the task set against a new configuration: cancel in-flight work
    /// for removed targets, drop scheduled entries, and re-seed from the
    /// declarative config plus prior-run state from the operation log.
    async fn rebuild(&self, cfg: &Arc<Config>) {
        let now = self.clock.now_utc();
        let repo_guids: HashSet<&str> = cfg.repos.iter().map(|r| r.guid.as_str()).collect();
        let plan_ids: HashSet<&str> = cfg.plans.iter().map(|p| p.id.as_str()).collect();

        let target_removed = |entry: &crate::services::runner_service::RunningOp| {
            (!entry.repo_guid.is_empty() && !repo_guids.contains(entry.repo_guid.as_str()))
                || (!entry.plan_id.is_empty() && !plan_ids.contains(entry.plan_id.as_str()))
        };
        let cancelled = self.running.cancel_matching(target_removed);
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled in-flight tasks for removed targets");
            // The new task set is installed only once those cancellations
            // have resolved.
            let deadline = std::time::Instant::now() + CANCEL_GRACE;
            while self.running.cancel_matching(target_removed) > 0
                && std::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        // Compute the new scheduled set before touching the queue; the
        // queue lock is never held across an await.
        let mut seeded: Vec<Task> = Vec::new();
        for plan in &cfg.plans {
            if plan.schedule.is_disabled() {
                continue;
            }
            let Some(repo) = cfg.repo(&plan.repo) else { continue };
            let last = self
                .oplog
                .last_successful("backup", Some(&plan.id), &repo.guid)
                .await
                .ok()
                .flatten();
            if let Some(next) = plan.schedule.next_after(now, last) {
                seeded.push(
                    Task::new(
                        TaskKind::Backup {
                            plan_id: plan.id.clone(),
                        },
                        &repo.guid,
                        &plan.id,
                        next,
                    )
                    .with_schedule(plan.schedule.clone()),
                );
            }
        }

        for repo in &cfg.repos {
            if !repo.prune_policy.schedule.is_disabled() {
                let last = self
                    .oplog
                    .last_successful("prune", None, &repo.guid)
                    .await
                    .ok()
                    .flatten();
                if let Some(next) = repo.prune_policy.schedule.next_after(now, last) {
                    seeded.push(
                        Task::new(
                            TaskKind::Prune {
                                repo_id: repo.id.clone(),
                            },
                            &repo.guid,
                            "",
                            next,
                        )
                        .with_priority(PRIORITY_MAINTENANCE)
                        .with_schedule(repo.prune_policy.schedule.clone()),
                    );
                }
            }
            if !repo.check_policy.schedule.is_disabled() {
                let last = self
                    .oplog
                    .last_successful("check", None, &repo.guid)
                    .await
                    .ok()
                    .flatten();
                if let Some(next) = repo.check_policy.schedule.next_after(now, last) {
                    seeded.push(
                        Task::new(
                            TaskKind::Check {
                                repo_id: repo.id.clone(),
                            },
                            &repo.guid,
                            "",
                            next,
                        )
                        .with_priority(PRIORITY_MAINTENANCE)
                        .with_schedule(repo.check_policy.schedule.clone()),
                    );
                }
            }

            // Low-priority daily stats pass per repo. A repo with no stats
            // history anchors at boot time rather than running immediately.
            let stats_schedule = SchedulePolicy {
                schedule: Schedule::IntervalDays { days: 1 },
                clock: ScheduleClock::LastRunTime,
            };
            let last = self
                .oplog
                .last_successful("stats", None, &repo.guid)
                .await
                .ok()
                .flatten()
                .or(Some(now));
            if let Some(next) = stats_schedule.next_after(now, last) {
                seeded.push(
                    Task::new(
                        TaskKind::Stats {
                            repo_id: repo.id.clone(),
                        },
                        &repo.guid,
                        "",
                        next,
                    )
                    .with_priority(PRIORITY_STATS)
                    .with_schedule(stats_schedule),
                );
            }
        }

        // Daily garbage collection, first pass an hour after boot.
        seeded.push(
            Task::new(
                TaskKind::CollectGarbage,
                "",
                "",
                now + chrono::Duration::hours(1),
            )
            .with_priority(PRIORITY_MAINTENANCE)
            .with_schedule(SchedulePolicy {
                schedule: Schedule::IntervalHours { hours: 24 },
                clock: ScheduleClock::LastRunTime,
            }),
        );

        {
            let mut queue = self.queue.lock().expect("queue lock");
            let entries = std::mem::take(&mut *queue);
            for mut entry in entries.into_iter() {
                // Scheduled entries are rebuilt from scratch; interactive
                // and follow-up entries survive if their target still
                // exists.
                if entry.task.schedule.is_some() {
                    continue;
                }
                let target_gone = (!entry.task.repo_guid.is_empty()
                    && !repo_guids.contains(entry.task.repo_guid.as_str()))
                    || (!entry.task.plan_id.is_empty()
                        && !plan_ids.contains(entry.task.plan_id.as_str()));
                if target_gone {
                    if let Some(done) = entry.task.done.take() {
                        let _ = done.send(Err("target removed from config".into()));
                    }
                    continue;
                }
                queue.push(entry);
            }
            for task in seeded {
                let entry = HeapEntry {
                    run_at: task.run_at,
                    priority: task.priority,
                    seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                    task,
                };
                queue.push(entry);
            }
        }
        self.notify.notify_one();
    }

    /// Wait for in-flight executions to finish, up to the deadline.
    async fn drain(&self, deadline: Duration) {
        let start = std::time::Instant::now();
        while self.executions.load(AtomicOrdering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                tracing::warn!(
                    remaining = self.executions.load(AtomicOrdering::SeqCst),
                    "drain deadline exceeded"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Number of queued tasks; exposed for the dashboard.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }

    /// Number of in-flight executions; exposed for the dashboard.
    pub fn active_executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }
}
