//! End-to-end orchestration scenarios over the scripted backup binary.

mod common;

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::Json;

use backrest::api::handlers;
use backrest::models::hook::{Hook, HookAction, HookCondition, HookOnError};
use backrest::models::operation::{Operation, OperationPayload, OperationStatus};
use backrest::models::plan::RetentionPolicy;
use backrest::services::oplog_service::OpSelector;
use backrest::services::tasks::{Task, TaskKind};

use common::{test_config, test_plan, test_repo, TestContext};

fn ops_of_kind<'a>(ops: &'a [Operation], kind: &str) -> Vec<&'a Operation> {
    ops.iter()
        .filter(|op| op.payload.kind() == kind)
        .collect()
}

fn command_hook(command: &str, condition: HookCondition, on_error: HookOnError) -> Hook {
    Hook {
        conditions: vec![condition],
        action: HookAction::Command {
            command: command.into(),
        },
        on_error,
    }
}

// ---------------------------------------------------------------------------
// S1: happy-path backup flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backup_produces_flow_of_backup_index_forget() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let plan = test_plan(
        "p1",
        &dir.path().join("data"),
        RetentionPolicy::KeepLastN { count: 100 },
    );
    std::fs::write(dir.path().join("data/hello.txt"), b"hello").unwrap();

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    let op_id = sut.backup("p1").await.expect("backup succeeds");

    let ops = sut
        .wait_for("backup, index, and forget to complete", |ops| {
            ops_of_kind(ops, "forget")
                .iter()
                .any(|op| op.status == OperationStatus::Success)
        })
        .await;

    let backup = ops.iter().find(|op| op.id == op_id).expect("backup op");
    assert_eq!(backup.status, OperationStatus::Success);
    assert_eq!(backup.payload.kind(), "backup");
    // First operation of the flow owns the flow id.
    assert_eq!(backup.flow_id, backup.id);

    let index = ops_of_kind(&ops, "index_snapshot")
        .into_iter()
        .find(|op| op.status == OperationStatus::Success)
        .expect("index op");
    assert_eq!(index.flow_id, backup.flow_id);
    assert!(!index.snapshot_id.is_empty(), "snapshot id must be set");

    let forget = ops_of_kind(&ops, "forget")
        .into_iter()
        .find(|op| op.status == OperationStatus::Success)
        .expect("forget op");
    assert_eq!(forget.flow_id, backup.flow_id);
    match &forget.payload {
        OperationPayload::Forget { removed, .. } => assert!(removed.is_empty()),
        other => panic!("unexpected payload {:?}", other),
    }

    // Flow order matches causal order.
    assert!(backup.id < index.id && index.id < forget.id);
}

// ---------------------------------------------------------------------------
// S2: retention enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn keep_last_one_forgets_older_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let plan = test_plan(
        "p1",
        &dir.path().join("data"),
        RetentionPolicy::KeepLastN { count: 1 },
    );
    std::fs::write(dir.path().join("data/file.txt"), b"v1").unwrap();

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    sut.backup("p1").await.expect("first backup");
    sut.backup("p1").await.expect("second backup");

    let ops = sut
        .wait_for("a forget pass removing one snapshot", |ops| {
            ops_of_kind(ops, "forget").iter().any(|op| {
                matches!(
                    &op.payload,
                    OperationPayload::Forget { removed, .. } if removed.len() == 1
                ) && op.status == OperationStatus::Success
            })
        })
        .await;

    // The forgotten snapshot's index record is flipped, not deleted.
    let removed_id = ops_of_kind(&ops, "forget")
        .iter()
        .find_map(|op| match &op.payload {
            OperationPayload::Forget { removed, .. } if removed.len() == 1 => {
                Some(removed[0].id.clone())
            }
            _ => None,
        })
        .expect("removed snapshot id");

    sut.wait_for("forgotten snapshot marked in the index", |ops| {
        ops_of_kind(ops, "index_snapshot").iter().any(|op| {
            op.snapshot_id == removed_id
                && matches!(
                    &op.payload,
                    OperationPayload::IndexSnapshot { forgot: true, .. }
                )
        })
    })
    .await;
}

// ---------------------------------------------------------------------------
// S3/S4: hook failure policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_start_hook_with_cancel_policy_cancels_backup() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let repo_uri = PathBuf::from(&repo.uri);
    let mut plan = test_plan("p1", &dir.path().join("data"), RetentionPolicy::KeepAll);
    plan.hooks = vec![command_hook(
        "exit 123",
        HookCondition::SnapshotStart,
        HookOnError::Cancel,
    )];

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    let result = sut.backup("p1").await;
    assert!(result.is_err(), "cancelled backup must report failure");

    let ops = sut.operations().await;
    let hook_op = ops_of_kind(&ops, "run_hook")
        .into_iter()
        .next()
        .expect("hook op");
    assert_eq!(hook_op.status, OperationStatus::Error);

    let backup_op = ops_of_kind(&ops, "backup").into_iter().next().expect("backup op");
    assert_eq!(backup_op.status, OperationStatus::UserCancelled);
    assert_eq!(hook_op.flow_id, backup_op.flow_id);

    // The backup tool was never invoked.
    assert_eq!(sut.snapshot_count(&repo_uri), 0);
}

#[tokio::test]
async fn failing_start_hook_with_ignore_policy_backs_up_anyway() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let repo_uri = PathBuf::from(&repo.uri);
    let mut plan = test_plan("p1", &dir.path().join("data"), RetentionPolicy::KeepAll);
    plan.hooks = vec![command_hook(
        "exit 123",
        HookCondition::SnapshotStart,
        HookOnError::Ignore,
    )];
    std::fs::write(dir.path().join("data/file.txt"), b"data").unwrap();

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    sut.backup("p1").await.expect("backup succeeds despite hook");

    let ops = sut.operations().await;
    let hook_op = ops_of_kind(&ops, "run_hook").into_iter().next().expect("hook op");
    assert_eq!(hook_op.status, OperationStatus::Error);

    let backup_op = ops_of_kind(&ops, "backup").into_iter().next().expect("backup op");
    assert_eq!(backup_op.status, OperationStatus::Success);
    assert_eq!(sut.snapshot_count(&repo_uri), 1);
}

#[tokio::test]
async fn failing_start_hook_with_fatal_policy_fails_backup() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let mut plan = test_plan("p1", &dir.path().join("data"), RetentionPolicy::KeepAll);
    plan.hooks = vec![command_hook(
        "exit 123",
        HookCondition::SnapshotStart,
        HookOnError::Fatal,
    )];

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    let result = sut.backup("p1").await;
    assert!(result.is_err());

    let ops = sut.operations().await;
    let backup_op = ops_of_kind(&ops, "backup").into_iter().next().expect("backup op");
    assert_eq!(backup_op.status, OperationStatus::Error);

    // A warning record accompanies the aborted task.
    assert!(ops
        .iter()
        .any(|op| op.status == OperationStatus::Warning && op.flow_id == backup_op.flow_id));
}

#[tokio::test]
async fn failing_start_hook_with_retry_policy_leaves_backup_pending() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let mut plan = test_plan("p1", &dir.path().join("data"), RetentionPolicy::KeepAll);
    plan.hooks = vec![command_hook(
        "exit 123",
        HookCondition::SnapshotStart,
        HookOnError::Retry10Min,
    )];

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    // The completion channel stays pending across the retry; don't wait on
    // it.
    let _rx = sut.backup_async("p1");

    let ops = sut
        .wait_for("hook failure recorded and backup parked", |ops| {
            ops_of_kind(ops, "run_hook")
                .iter()
                .any(|op| op.status == OperationStatus::Error)
                && ops_of_kind(ops, "backup")
                    .iter()
                    .any(|op| op.status == OperationStatus::Pending)
        })
        .await;

    let backup_op = ops_of_kind(&ops, "backup").into_iter().next().expect("backup op");
    assert_eq!(backup_op.status, OperationStatus::Pending);
    // The retry is parked well in the future; nothing else runs meanwhile.
    assert!(ops_of_kind(&ops, "index_snapshot").is_empty());
}

// ---------------------------------------------------------------------------
// S5: user-initiated cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_during_backup_reaches_terminal_state_without_forget() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let mut plan = test_plan(
        "p1",
        &dir.path().join("data"),
        RetentionPolicy::KeepLastN { count: 1 },
    );
    // A slow hook keeps the operation in progress long enough to cancel.
    plan.hooks = vec![command_hook(
        "sleep 2",
        HookCondition::SnapshotStart,
        HookOnError::Ignore,
    )];

    let sut = TestContext::new(test_config("test", repo, vec![plan])).await;

    let _rx = sut.backup_async("p1");

    let ops = sut
        .wait_for("backup in progress", |ops| {
            ops_of_kind(ops, "backup")
                .iter()
                .any(|op| op.status == OperationStatus::InProgress)
        })
        .await;
    let backup_id = ops_of_kind(&ops, "backup")[0].id;

    sut.orchestrator
        .cancel_operation(backup_id)
        .await
        .expect("cancel");

    sut.wait_for("backup terminal after cancel", |ops| {
        ops.iter().any(|op| {
            op.id == backup_id
                && matches!(
                    op.status,
                    OperationStatus::Error
                        | OperationStatus::UserCancelled
                        | OperationStatus::SystemCancelled
                )
        })
    })
    .await;

    // No forget pass follows a cancelled backup.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let ops = sut.operations().await;
    assert!(ops_of_kind(&ops, "forget").is_empty());
}

// ---------------------------------------------------------------------------
// S6: restore round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restore_round_trip_recovers_file_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let data_dir = dir.path().join("data");
    let plan = test_plan("p1", &data_dir, RetentionPolicy::KeepAll);
    std::fs::write(data_dir.join("findme.txt"), b"test data").unwrap();

    let sut = TestContext::new(test_config("test", repo.clone(), vec![plan])).await;

    sut.backup("p1").await.expect("backup");

    let ops = sut
        .wait_for("snapshot indexed", |ops| {
            ops_of_kind(ops, "index_snapshot")
                .iter()
                .any(|op| op.status == OperationStatus::Success)
        })
        .await;
    let snapshot_id = ops_of_kind(&ops, "index_snapshot")[0].snapshot_id.clone();
    assert!(!snapshot_id.is_empty());

    let restore_target = dir.path().join("restore");
    let (task, rx) = Task::new(
        TaskKind::Restore {
            repo_id: "local".into(),
            plan_id: "p1".into(),
            snapshot_id: snapshot_id.clone(),
            path: None,
            target: restore_target.to_string_lossy().into_owned(),
        },
        &repo.guid,
        "p1",
        chrono::Utc::now(),
    )
    .interactive();
    sut.orchestrator.enqueue(task);
    let restore_op_id = rx.await.unwrap().expect("restore succeeds");

    let restore_op = sut.oplog.get(restore_op_id).await.unwrap();
    assert_eq!(restore_op.status, OperationStatus::Success);
    assert_eq!(restore_op.snapshot_id, snapshot_id);

    // The restored tree contains the original bytes somewhere beneath the
    // target.
    let mut found = None;
    let mut stack = vec![restore_target.clone()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().is_some_and(|n| n == "findme.txt") {
                found = Some(path);
            }
        }
    }
    let found = found.expect("findme.txt restored");
    assert_eq!(std::fs::read(found).unwrap(), b"test data");
}

// ---------------------------------------------------------------------------
// RunCommand and transcripts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_command_records_transcript_behind_logref() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let sut = TestContext::new(test_config("test", repo.clone(), vec![])).await;

    let (task, rx) = Task::new(
        TaskKind::RunCommand {
            repo_id: "local".into(),
            command: "help".into(),
        },
        &repo.guid,
        "",
        chrono::Utc::now(),
    )
    .interactive();
    sut.orchestrator.enqueue(task);
    let op_id = rx.await.unwrap().expect("command succeeds");

    let op = sut.oplog.get(op_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    let logref = match &op.payload {
        OperationPayload::RunCommand {
            command,
            output_logref,
        } => {
            assert_eq!(command, "help");
            assert!(!output_logref.is_empty());
            output_logref.clone()
        }
        other => panic!("unexpected payload {:?}", other),
    };

    let transcript = sut.logstore.read(&logref).await.unwrap();
    assert!(String::from_utf8_lossy(&transcript).contains("Usage"));
}

// ---------------------------------------------------------------------------
// RemoveRepo cascade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_repo_cascades_operation_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let repo_uri = PathBuf::from(&repo.uri);
    let sut = TestContext::new(test_config("test", repo.clone(), vec![])).await;

    let (task, rx) = Task::new(
        TaskKind::RunCommand {
            repo_id: "local".into(),
            command: "help".into(),
        },
        &repo.guid,
        "",
        chrono::Utc::now(),
    )
    .interactive();
    sut.orchestrator.enqueue(task);
    rx.await.unwrap().expect("command succeeds");

    assert_eq!(sut.operations().await.len(), 1);

    let state = sut.app_state();
    handlers::config::remove_repo(State(state), Path("local".to_string()))
        .await
        .expect("remove repo");

    assert!(sut.operations().await.is_empty());
    assert!(sut.config.get().repos.is_empty());
    // Repo contents on disk are untouched.
    assert!(repo_uri.exists());
}

// ---------------------------------------------------------------------------
// Config CAS through the handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn set_config_enforces_modno_cas() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path());
    let sut = TestContext::new(test_config("test", repo, vec![])).await;

    let state = sut.app_state();

    let mut stale = (*sut.config.get()).clone();
    stale.modno = 9999;
    let result =
        handlers::config::set_config(State(state.clone()), Json(stale)).await;
    assert!(result.is_err(), "stale modno must be rejected");

    let fresh = (*sut.config.get()).clone();
    let expected = fresh.modno + 1;
    let Json(updated) = handlers::config::set_config(State(state), Json(fresh))
        .await
        .expect("matching modno accepted");
    assert_eq!(updated.modno, expected);
}

// ---------------------------------------------------------------------------
// Snapshot indexing across instances
// ---------------------------------------------------------------------------

#[tokio::test]
async fn index_snapshots_attributes_foreign_instances() {
    let dir = tempfile::tempdir().unwrap();
    let shared_repo = test_repo(dir.path());
    let data_dir = dir.path().join("data");

    // Two instances over the same repository directory.
    let host1 = TestContext::new(test_config(
        "host1",
        shared_repo.clone(),
        vec![test_plan("p1", &data_dir, RetentionPolicy::KeepAll)],
    ))
    .await;
    let host2 = TestContext::new(test_config(
        "host2",
        shared_repo.clone(),
        vec![test_plan("p2", &data_dir, RetentionPolicy::KeepAll)],
    ))
    .await;
    std::fs::write(data_dir.join("file.txt"), b"x").unwrap();

    host1.backup("p1").await.expect("host1 backup");
    host2.backup("p2").await.expect("host2 backup");

    // Each host reconciles and discovers the other's snapshot.
    for host in [&host1, &host2] {
        let (task, rx) = Task::new(
            TaskKind::IndexSnapshots {
                repo_id: "local".into(),
            },
            &shared_repo.guid,
            "",
            chrono::Utc::now(),
        )
        .interactive();
        host.orchestrator.enqueue(task);
        rx.await.unwrap().expect("index");
    }

    for (host, own_instance, other_instance) in
        [(&host1, "host1", "host2"), (&host2, "host2", "host1")]
    {
        let ops = host
            .oplog
            .query(&OpSelector {
                kinds: Some(vec!["index_snapshot".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ops.len(), 2, "{own_instance} sees both snapshots");
        assert!(ops.iter().any(|op| op.instance_id == own_instance));
        assert!(
            ops.iter().any(|op| op.instance_id == other_instance),
            "{own_instance} attributes the foreign snapshot to {other_instance}"
        );
    }
}

// ---------------------------------------------------------------------------
// Restart recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_operations_become_system_cancelled_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("oplog.sqlite");

    {
        let pool = backrest::db::create_pool(&db_path).await.unwrap();
        backrest::db::init_schema(&pool).await.unwrap();
        let oplog = backrest::services::oplog_service::OpLog::open(pool, "inst")
            .await
            .unwrap();
        let mut op = Operation::new(
            "inst",
            "local",
            "guid",
            "p1",
            chrono::Utc::now(),
            OperationPayload::new_backup(),
        );
        op.status = OperationStatus::InProgress;
        oplog.add(&mut op).await.unwrap();
    }

    // Simulated restart: reopen the same database file.
    let pool = backrest::db::create_pool(&db_path).await.unwrap();
    backrest::db::init_schema(&pool).await.unwrap();
    let oplog = backrest::services::oplog_service::OpLog::open(pool, "inst")
        .await
        .unwrap();
    let rewritten = oplog.recover_in_progress(chrono::Utc::now()).await.unwrap();
    assert_eq!(rewritten, 1);

    let ops = oplog.query(&OpSelector::all()).await.unwrap();
    assert_eq!(ops[0].status, OperationStatus::SystemCancelled);
    assert!(ops[0].unix_time_end_ms >= ops[0].unix_time_start_ms);
}
