//! The operation log: a durable, single-writer, many-reader indexed store of
//! operation records with a broadcast subscription feed.
//!
//! All mutations run behind one async mutex and commit to the backing SQLite
//! database before the corresponding event is broadcast, so observers never
//! see a phantom event. Subscribers that fall behind receive
//! `RecvError::Lagged` from the broadcast channel and must requery.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::operation::{Operation, OperationPayload, OperationStatus};

/// How many events the subscription channel buffers before a slow consumer
/// is marked lagged.
const EVENT_BUFFER: usize = 256;

/// Idle interval after which a keep-alive event is broadcast so streaming
/// consumers can heartbeat.
const KEEP_ALIVE_SECS: u64 = 30;

/// An event on the operation log subscription feed.
#[derive(Debug, Clone)]
pub enum OpEvent {
    Created(Operation),
    Updated(Operation),
    Deleted(Vec<i64>),
    KeepAlive,
}

/// Conjunctive predicate over operations. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OpSelector {
    pub ids: Option<Vec<i64>>,
    pub instance_id: Option<String>,
    pub original_instance_keyid: Option<String>,
    pub repo_guid: Option<String>,
    pub plan_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub flow_id: Option<i64>,
    pub kinds: Option<Vec<String>>,
    pub statuses: Option<Vec<OperationStatus>>,
    pub started_after_ms: Option<i64>,
    pub started_before_ms: Option<i64>,
}

enum Bind {
    Int(i64),
    Text(String),
}

impl OpSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_flow(flow_id: i64) -> Self {
        Self {
            flow_id: Some(flow_id),
            ..Default::default()
        }
    }

    pub fn for_repo_guid(guid: impl Into<String>) -> Self {
        Self {
            repo_guid: Some(guid.into()),
            ..Default::default()
        }
    }

    pub fn for_ids(ids: Vec<i64>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    /// Compile to a WHERE clause fragment plus bind values. Returns `"1=1"`
    /// when the selector matches everything.
    fn to_sql(&self) -> (String, Vec<Bind>) {
        let mut conds: Vec<String> = Vec::new();
        let mut binds: Vec<Bind> = Vec::new();

        if let Some(ids) = &self.ids {
            if ids.is_empty() {
                conds.push("0=1".into());
            } else {
                let placeholders = vec!["?"; ids.len()].join(", ");
                conds.push(format!("id IN ({})", placeholders));
                binds.extend(ids.iter().map(|id| Bind::Int(*id)));
            }
        }
        if let Some(v) = &self.instance_id {
            conds.push("instance_id = ?".into());
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = &self.original_instance_keyid {
            conds.push("original_instance_keyid = ?".into());
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = &self.repo_guid {
            conds.push("repo_guid = ?".into());
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = &self.plan_id {
            conds.push("plan_id = ?".into());
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = &self.snapshot_id {
            conds.push("snapshot_id = ?".into());
            binds.push(Bind::Text(v.clone()));
        }
        if let Some(v) = self.flow_id {
            conds.push("flow_id = ?".into());
            binds.push(Bind::Int(v));
        }
        if let Some(kinds) = &self.kinds {
            if kinds.is_empty() {
                conds.push("0=1".into());
            } else {
                let placeholders = vec!["?"; kinds.len()].join(", ");
                conds.push(format!("kind IN ({})", placeholders));
                binds.extend(kinds.iter().map(|k| Bind::Text(k.clone())));
            }
        }
        if let Some(statuses) = &self.statuses {
            if statuses.is_empty() {
                conds.push("0=1".into());
            } else {
                let placeholders = vec!["?"; statuses.len()].join(", ");
                conds.push(format!("status IN ({})", placeholders));
                binds.extend(statuses.iter().map(|s| Bind::Text(s.as_str().to_string())));
            }
        }
        if let Some(v) = self.started_after_ms {
            conds.push("unix_time_start_ms >= ?".into());
            binds.push(Bind::Int(v));
        }
        if let Some(v) = self.started_before_ms {
            conds.push("unix_time_start_ms < ?".into());
            binds.push(Bind::Int(v));
        }

        if conds.is_empty() {
            ("1=1".into(), binds)
        } else {
            (conds.join(" AND "), binds)
        }
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: i64,
    modno: i64,
    instance_id: String,
    original_instance_keyid: String,
    original_id: i64,
    repo_id: String,
    repo_guid: String,
    plan_id: String,
    flow_id: i64,
    snapshot_id: String,
    unix_time_start_ms: i64,
    unix_time_end_ms: i64,
    status: String,
    display_message: String,
    logref: String,
    payload: String,
}

impl TryFrom<OperationRow> for Operation {
    type Error = AppError;

    fn try_from(row: OperationRow) -> Result<Self> {
        let status = OperationStatus::parse(&row.status)
            .ok_or_else(|| AppError::Database(format!("unknown status '{}'", row.status)))?;
        let payload: OperationPayload = serde_json::from_str(&row.payload)
            .map_err(|e| AppError::Database(format!("corrupt payload for op {}: {}", row.id, e)))?;
        Ok(Operation {
            id: row.id,
            modno: row.modno,
            instance_id: row.instance_id,
            original_instance_keyid: row.original_instance_keyid,
            original_id: row.original_id,
            repo_id: row.repo_id,
            repo_guid: row.repo_guid,
            plan_id: row.plan_id,
            flow_id: row.flow_id,
            snapshot_id: row.snapshot_id,
            unix_time_start_ms: row.unix_time_start_ms,
            unix_time_end_ms: row.unix_time_end_ms,
            status,
            display_message: row.display_message,
            logref: row.logref,
            payload,
        })
    }
}

const SELECT_COLUMNS: &str = "id, modno, instance_id, original_instance_keyid, original_id, \
     repo_id, repo_guid, plan_id, flow_id, snapshot_id, unix_time_start_ms, unix_time_end_ms, \
     status, display_message, logref, payload";

/// The durable operation log.
pub struct OpLog {
    pool: SqlitePool,
    instance_id: String,
    /// Serializes all writes; modno assignment happens under this lock.
    write_lock: Mutex<()>,
    next_modno: AtomicI64,
    events: broadcast::Sender<OpEvent>,
    /// Millis timestamp of the last broadcast, for the keep-alive timer.
    last_event_ms: Arc<AtomicI64>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl OpLog {
    /// Open the log over an initialized pool, seed the modno counter, and
    /// start the keep-alive timer.
    pub async fn open(pool: SqlitePool, instance_id: &str) -> Result<Arc<Self>> {
        let max_modno: Option<i64> = sqlx::query_scalar("SELECT MAX(modno) FROM operations")
            .fetch_one(&pool)
            .await?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let log = Arc::new(Self {
            pool,
            instance_id: instance_id.to_string(),
            write_lock: Mutex::new(()),
            next_modno: AtomicI64::new(max_modno.unwrap_or(0) + 1),
            events,
            last_event_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
            keepalive: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::keepalive_loop(
            log.events.clone(),
            Arc::clone(&log.last_event_ms),
        ));
        *log.keepalive.lock().await = Some(handle);

        Ok(log)
    }

    async fn keepalive_loop(events: broadcast::Sender<OpEvent>, last_event_ms: Arc<AtomicI64>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(KEEP_ALIVE_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let idle_ms = Utc::now().timestamp_millis() - last_event_ms.load(Ordering::Relaxed);
            if idle_ms >= (KEEP_ALIVE_SECS as i64) * 1000 && events.receiver_count() > 0 {
                let _ = events.send(OpEvent::KeepAlive);
            }
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribe to the event feed. Callers that need a complete view must
    /// also query: the feed starts at subscription time.
    pub fn subscribe(&self) -> broadcast::Receiver<OpEvent> {
        self.events.subscribe()
    }

    fn broadcast(&self, event: OpEvent) {
        self.last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        let _ = self.events.send(event);
    }

    fn take_modno(&self) -> i64 {
        self.next_modno.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert a fresh operation. Assigns `id` and `modno`; an operation with
    /// `flow_id == 0` starts a new flow whose id is the operation's own id.
    pub async fn add(&self, op: &mut Operation) -> Result<()> {
        if op.id != 0 {
            return Err(AppError::Validation("operation already has an id".into()));
        }
        let _guard = self.write_lock.lock().await;
        op.modno = self.take_modno();
        let payload = serde_json::to_string(&op.payload)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO operations (
                modno, instance_id, original_instance_keyid, original_id,
                repo_id, repo_guid, plan_id, flow_id, snapshot_id,
                unix_time_start_ms, unix_time_end_ms, status, display_message,
                logref, kind, payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(op.modno)
        .bind(&op.instance_id)
        .bind(&op.original_instance_keyid)
        .bind(op.original_id)
        .bind(&op.repo_id)
        .bind(&op.repo_guid)
        .bind(&op.plan_id)
        .bind(op.flow_id)
        .bind(&op.snapshot_id)
        .bind(op.unix_time_start_ms)
        .bind(op.unix_time_end_ms)
        .bind(op.status.as_str())
        .bind(&op.display_message)
        .bind(&op.logref)
        .bind(op.payload.kind())
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

        op.id = result.last_insert_rowid();
        if op.flow_id == 0 {
            op.flow_id = op.id;
            sqlx::query("UPDATE operations SET flow_id = ? WHERE id = ?")
                .bind(op.flow_id)
                .bind(op.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.broadcast(OpEvent::Created(op.clone()));
        Ok(())
    }

    /// Update an existing operation in place, bumping its modno.
    pub async fn update(&self, op: &mut Operation) -> Result<()> {
        if op.id == 0 {
            return Err(AppError::Validation("operation has no id".into()));
        }
        let _guard = self.write_lock.lock().await;
        op.modno = self.take_modno();
        self.write_update(op).await?;
        self.broadcast(OpEvent::Updated(op.clone()));
        Ok(())
    }

    async fn write_update(&self, op: &Operation) -> Result<()> {
        let payload = serde_json::to_string(&op.payload)?;
        let result = sqlx::query(
            r#"
            UPDATE operations SET
                modno = ?, instance_id = ?, original_instance_keyid = ?,
                original_id = ?, repo_id = ?, repo_guid = ?, plan_id = ?,
                flow_id = ?, snapshot_id = ?, unix_time_start_ms = ?,
                unix_time_end_ms = ?, status = ?, display_message = ?,
                logref = ?, kind = ?, payload = ?
            WHERE id = ?
            "#,
        )
        .bind(op.modno)
        .bind(&op.instance_id)
        .bind(&op.original_instance_keyid)
        .bind(op.original_id)
        .bind(&op.repo_id)
        .bind(&op.repo_guid)
        .bind(&op.plan_id)
        .bind(op.flow_id)
        .bind(&op.snapshot_id)
        .bind(op.unix_time_start_ms)
        .bind(op.unix_time_end_ms)
        .bind(op.status.as_str())
        .bind(&op.display_message)
        .bind(&op.logref)
        .bind(op.payload.kind())
        .bind(&payload)
        .bind(op.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("operation {}", op.id)));
        }
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Operation> {
        let query = format!("SELECT {} FROM operations WHERE id = ?", SELECT_COLUMNS);
        let row: Option<OperationRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| AppError::NotFound(format!("operation {}", id)))?
            .try_into()
    }

    /// Fetch all matching operations in ascending id order.
    pub async fn query(&self, selector: &OpSelector) -> Result<Vec<Operation>> {
        let (cond, binds) = selector.to_sql();
        let sql = format!(
            "SELECT {} FROM operations WHERE {} ORDER BY id ASC",
            SELECT_COLUMNS, cond
        );
        let mut query = sqlx::query_as::<_, OperationRow>(&sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(v),
                Bind::Text(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Operation::try_from).collect()
    }

    /// Fetch the newest `n` matching operations, still in ascending id order.
    pub async fn query_last(&self, selector: &OpSelector, n: u32) -> Result<Vec<Operation>> {
        let (cond, binds) = selector.to_sql();
        let sql = format!(
            "SELECT {} FROM operations WHERE {} ORDER BY id DESC LIMIT ?",
            SELECT_COLUMNS, cond
        );
        let mut query = sqlx::query_as::<_, OperationRow>(&sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(v),
                Bind::Text(v) => query.bind(v),
            };
        }
        query = query.bind(n as i64);
        let rows = query.fetch_all(&self.pool).await?;
        let mut ops: Vec<Operation> = rows
            .into_iter()
            .map(Operation::try_from)
            .collect::<Result<_>>()?;
        ops.reverse();
        Ok(ops)
    }

    /// Iterate matching operations in ascending id order, stopping early when
    /// the callback breaks.
    pub async fn for_each(
        &self,
        selector: &OpSelector,
        mut f: impl FnMut(Operation) -> ControlFlow<()>,
    ) -> Result<()> {
        for op in self.query(selector).await? {
            if f(op).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Delete matching operations; returns the count and broadcasts the
    /// deleted ids.
    pub async fn delete(&self, selector: &OpSelector) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let (cond, binds) = selector.to_sql();
        let sql = format!("SELECT id FROM operations WHERE {}", cond);
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Int(v) => query.bind(*v),
                Bind::Text(v) => query.bind(v.clone()),
            };
        }
        let ids: Vec<i64> = query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get::<i64, _>(0))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM operations WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        let result = query.execute(&self.pool).await?;

        self.broadcast(OpEvent::Deleted(ids));
        Ok(result.rows_affected())
    }

    /// Apply `f` to every matching operation: a returned operation is
    /// persisted with a fresh modno, `None` deletes the record. Returns the
    /// number of affected operations.
    pub async fn transform(
        &self,
        selector: &OpSelector,
        mut f: impl FnMut(Operation) -> Option<Operation>,
    ) -> Result<u64> {
        let matching = self.query(selector).await?;
        let mut affected = 0u64;
        let mut deleted: Vec<i64> = Vec::new();

        let _guard = self.write_lock.lock().await;
        for op in matching {
            let id = op.id;
            let before = op.clone();
            match f(op) {
                Some(mut updated) => {
                    if updated == before {
                        continue;
                    }
                    updated.id = id;
                    updated.modno = self.take_modno();
                    self.write_update(&updated).await?;
                    self.broadcast(OpEvent::Updated(updated));
                    affected += 1;
                }
                None => {
                    sqlx::query("DELETE FROM operations WHERE id = ?")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                    deleted.push(id);
                    affected += 1;
                }
            }
        }
        if !deleted.is_empty() {
            self.broadcast(OpEvent::Deleted(deleted));
        }
        Ok(affected)
    }

    /// Rewrite any operation owned by this instance that is still marked
    /// running to SYSTEM_CANCELLED. Called once at boot, before the
    /// scheduler starts.
    pub async fn recover_in_progress(&self, now: DateTime<Utc>) -> Result<u64> {
        let selector = OpSelector {
            instance_id: Some(self.instance_id.clone()),
            statuses: Some(vec![OperationStatus::Pending, OperationStatus::InProgress]),
            ..Default::default()
        };
        let stranded = self.query(&selector).await?;
        let count = stranded.len() as u64;
        for mut op in stranded {
            op.finalize(OperationStatus::SystemCancelled, now);
            op.display_message = "interrupted by restart".into();
            self.update(&mut op).await?;
        }
        if count > 0 {
            tracing::warn!(count, "rewrote interrupted operations to SYSTEM_CANCELLED");
        }
        Ok(count)
    }

    /// Start time of the most recent successful operation of the given kind
    /// for a (plan, repo) pair, used to seed LAST_RUN_TIME schedules.
    pub async fn last_successful(
        &self,
        kind: &str,
        plan_id: Option<&str>,
        repo_guid: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let selector = OpSelector {
            plan_id: plan_id.map(String::from),
            repo_guid: Some(repo_guid.to_string()),
            kinds: Some(vec![kind.to_string()]),
            statuses: Some(vec![OperationStatus::Success, OperationStatus::Warning]),
            ..Default::default()
        };
        let ops = self.query_last(&selector, 1).await?;
        Ok(ops.last().map(|op| op.start_time()))
    }

    /// Look up a remote operation by its origin identity, for sync upserts.
    pub async fn find_by_original(
        &self,
        instance_id: &str,
        original_id: i64,
    ) -> Result<Option<Operation>> {
        let query = format!(
            "SELECT {} FROM operations WHERE instance_id = ? AND original_id = ?",
            SELECT_COLUMNS
        );
        let row: Option<OperationRow> = sqlx::query_as(&query)
            .bind(instance_id)
            .bind(original_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Operation::try_from).transpose()
    }
}

impl Drop for OpLog {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.keepalive.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::operation::OperationPayload;

    async fn open_log(dir: &tempfile::TempDir) -> Arc<OpLog> {
        let pool = db::create_pool(&dir.path().join("oplog.sqlite")).await.unwrap();
        db::init_schema(&pool).await.unwrap();
        OpLog::open(pool, "test-instance").await.unwrap()
    }

    fn backup_op() -> Operation {
        Operation::new(
            "test-instance",
            "local",
            "guid-1",
            "plan-1",
            Utc::now(),
            OperationPayload::new_backup(),
        )
    }

    #[tokio::test]
    async fn add_assigns_id_and_flow() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut op = backup_op();
        log.add(&mut op).await.unwrap();
        assert!(op.id > 0);
        assert_eq!(op.flow_id, op.id, "first op of a flow owns the flow id");

        let fetched = log.get(op.id).await.unwrap();
        assert_eq!(fetched, op);
    }

    #[tokio::test]
    async fn flow_id_is_inherited_when_preset() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut first = backup_op();
        log.add(&mut first).await.unwrap();

        let mut second = backup_op();
        second.flow_id = first.flow_id;
        log.add(&mut second).await.unwrap();
        assert_eq!(second.flow_id, first.flow_id);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn modno_strictly_increases_across_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut a = backup_op();
        log.add(&mut a).await.unwrap();
        let mut b = backup_op();
        log.add(&mut b).await.unwrap();
        assert!(b.modno > a.modno);

        let prev = b.modno;
        a.status = OperationStatus::InProgress;
        log.update(&mut a).await.unwrap();
        assert!(a.modno > prev);
    }

    #[tokio::test]
    async fn update_missing_operation_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut op = backup_op();
        op.id = 999;
        assert!(matches!(
            log.update(&mut op).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_see_created_before_updated() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let mut rx = log.subscribe();

        let mut op = backup_op();
        log.add(&mut op).await.unwrap();
        op.status = OperationStatus::InProgress;
        log.update(&mut op).await.unwrap();

        match rx.recv().await.unwrap() {
            OpEvent::Created(created) => assert_eq!(created.id, op.id),
            other => panic!("expected Created, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            OpEvent::Updated(updated) => {
                assert_eq!(updated.status, OperationStatus::InProgress)
            }
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_broadcasts_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut op = backup_op();
        log.add(&mut op).await.unwrap();
        let mut rx = log.subscribe();

        let deleted = log.delete(&OpSelector::for_ids(vec![op.id])).await.unwrap();
        assert_eq!(deleted, 1);
        match rx.recv().await.unwrap() {
            OpEvent::Deleted(ids) => assert_eq!(ids, vec![op.id]),
            other => panic!("expected Deleted, got {:?}", other),
        }
        assert!(matches!(log.get(op.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut a = backup_op();
        log.add(&mut a).await.unwrap();
        let mut b = backup_op();
        b.repo_guid = "guid-2".into();
        log.add(&mut b).await.unwrap();
        let mut c = Operation::new(
            "test-instance",
            "local",
            "guid-1",
            "plan-1",
            Utc::now(),
            OperationPayload::RunCommand {
                command: "help".into(),
                output_logref: String::new(),
            },
        );
        log.add(&mut c).await.unwrap();

        let by_guid = log.query(&OpSelector::for_repo_guid("guid-1")).await.unwrap();
        assert_eq!(by_guid.len(), 2);

        let by_kind = log
            .query(&OpSelector {
                repo_guid: Some("guid-1".into()),
                kinds: Some(vec!["backup".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].id, a.id);
    }

    #[tokio::test]
    async fn query_returns_ascending_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        for _ in 0..5 {
            let mut op = backup_op();
            log.add(&mut op).await.unwrap();
        }
        let ops = log.query(&OpSelector::all()).await.unwrap();
        let ids: Vec<i64> = ops.iter().map(|op| op.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn query_last_limits_from_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut op = backup_op();
            log.add(&mut op).await.unwrap();
            ids.push(op.id);
        }
        let last_two = log.query_last(&OpSelector::all(), 2).await.unwrap();
        assert_eq!(
            last_two.iter().map(|op| op.id).collect::<Vec<_>>(),
            &ids[3..]
        );
    }

    #[tokio::test]
    async fn transform_updates_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut keep = backup_op();
        log.add(&mut keep).await.unwrap();
        let mut drop_me = backup_op();
        log.add(&mut drop_me).await.unwrap();

        let drop_id = drop_me.id;
        let affected = log
            .transform(&OpSelector::all(), |mut op| {
                if op.id == drop_id {
                    None
                } else {
                    op.display_message = "touched".into();
                    Some(op)
                }
            })
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let remaining = log.query(&OpSelector::all()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].display_message, "touched");
    }

    #[tokio::test]
    async fn recovery_rewrites_running_ops() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut running = backup_op();
        running.status = OperationStatus::InProgress;
        log.add(&mut running).await.unwrap();
        let mut done = backup_op();
        done.status = OperationStatus::Success;
        log.add(&mut done).await.unwrap();
        // Remote in-progress ops are not ours to rewrite.
        let mut remote = backup_op();
        remote.instance_id = "other".into();
        remote.status = OperationStatus::InProgress;
        log.add(&mut remote).await.unwrap();

        let rewritten = log.recover_in_progress(Utc::now()).await.unwrap();
        assert_eq!(rewritten, 1);

        assert_eq!(
            log.get(running.id).await.unwrap().status,
            OperationStatus::SystemCancelled
        );
        assert_eq!(log.get(done.id).await.unwrap().status, OperationStatus::Success);
        assert_eq!(
            log.get(remote.id).await.unwrap().status,
            OperationStatus::InProgress
        );
    }

    #[tokio::test]
    async fn last_successful_backup_finds_newest() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        let mut old = backup_op();
        old.status = OperationStatus::Success;
        old.unix_time_start_ms = 1_000;
        log.add(&mut old).await.unwrap();

        let mut newer = backup_op();
        newer.status = OperationStatus::Success;
        newer.unix_time_start_ms = 2_000;
        log.add(&mut newer).await.unwrap();

        let mut failed = backup_op();
        failed.status = OperationStatus::Error;
        failed.unix_time_start_ms = 3_000;
        log.add(&mut failed).await.unwrap();

        let last = log
            .last_successful("backup", Some("plan-1"), "guid-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.timestamp_millis(), 2_000);

        assert!(log
            .last_successful("backup", Some("plan-1"), "other-guid")
            .await
            .unwrap()
            .is_none());
    }
}
