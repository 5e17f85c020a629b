//! Common test infrastructure: a full orchestrator wired against a scripted
//! stand-in for the backup binary, so integration tests are hermetic.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use backrest::api::AppState;
use backrest::clock::SystemClock;
use backrest::db;
use backrest::models::config::Config;
use backrest::models::operation::Operation;
use backrest::models::plan::{Plan, RetentionPolicy, SchedulePolicy};
use backrest::models::repo::Repo;
use backrest::services::config_service::ConfigManager;
use backrest::services::logstore_service::LogStore;
use backrest::services::oplog_service::{OpLog, OpSelector};
use backrest::services::scheduler_service::Orchestrator;
use backrest::services::sync_service::SyncBridge;
use backrest::services::tasks::{Task, TaskKind};

/// The scripted backup binary. State lives inside the repository directory:
/// one JSON object per snapshot plus a copied data tree, so snapshots,
/// forget, and restore behave consistently across invocations.
const FAKE_RESTIC: &str = r#"#!/bin/sh
set -eu

REPO="${RESTIC_REPOSITORY:?RESTIC_REPOSITORY not set}"
: "${RESTIC_PASSWORD:?RESTIC_PASSWORD not set}"

cmd="${1:-help}"
shift || true

snapdir="$REPO/snapshots"
datadir="$REPO/data"

now_iso() { date -u +%Y-%m-%dT%H:%M:%SZ; }

emit_array() {
    printf '['
    first=1
    for f in "$@"; do
        [ -f "$f" ] || continue
        if [ $first -eq 1 ]; then first=0; else printf ','; fi
        tr -d '\n' < "$f"
    done
    printf ']'
}

case "$cmd" in
init)
    mkdir -p "$snapdir" "$datadir"
    echo "created repository at $REPO"
    ;;
backup)
    mkdir -p "$snapdir" "$datadir"
    tags=""
    paths=""
    while [ $# -gt 0 ]; do
        case "$1" in
            --tag) shift; tags="$tags $1" ;;
            --exclude|--iexclude) shift ;;
            --*) ;;
            *) paths="$paths $1" ;;
        esac
        shift
    done
    id="$(date +%s%N)"
    mkdir -p "$datadir/$id"
    nfiles=0
    for p in $paths; do
        if [ -e "$p" ]; then
            cp -a --parents "$p" "$datadir/$id/" 2>/dev/null || cp -r "$p" "$datadir/$id/"
            nfiles=$((nfiles + $(find "$p" -type f | wc -l)))
        fi
    done
    tags_json=""
    for t in $tags; do
        if [ -z "$tags_json" ]; then tags_json="\"$t\""; else tags_json="$tags_json,\"$t\""; fi
    done
    paths_json=""
    for p in $paths; do
        if [ -z "$paths_json" ]; then paths_json="\"$p\""; else paths_json="$paths_json,\"$p\""; fi
    done
    printf '{"id":"%s","time":"%s","tags":[%s],"paths":[%s]}' \
        "$id" "$(now_iso)" "$tags_json" "$paths_json" > "$snapdir/$id.json"
    echo '{"message_type":"status","percent_done":0.5,"files_done":1,"bytes_done":512,"total_bytes":1024}'
    printf '{"message_type":"summary","files_new":%s,"files_changed":0,"files_unmodified":0,"data_added":1024,"total_files_processed":%s,"total_bytes_processed":2048,"snapshot_id":"%s"}\n' \
        "$nfiles" "$nfiles" "$id"
    ;;
snapshots)
    tag=""
    while [ $# -gt 0 ]; do
        case "$1" in
            --tag) shift; tag="$1" ;;
        esac
        shift
    done
    files=""
    for f in "$snapdir"/*.json; do
        [ -f "$f" ] || continue
        if [ -n "$tag" ]; then
            grep -q "\"$tag\"" "$f" || continue
        fi
        files="$files $f"
    done
    emit_array $files
    echo ""
    ;;
forget)
    keep=""
    tag=""
    ids=""
    while [ $# -gt 0 ]; do
        case "$1" in
            --keep-last) shift; keep="$1" ;;
            --keep-within) shift ;;
            --keep-*) shift ;;
            --tag) shift; tag="$1" ;;
            --group-by) shift ;;
            --*) ;;
            *) [ -n "$1" ] && ids="$ids $1" ;;
        esac
        shift
    done
    if [ -n "$ids" ]; then
        for id in $ids; do
            rm -f "$snapdir/$id.json"
            rm -rf "$datadir/$id"
        done
        echo "removed snapshots:$ids"
        exit 0
    fi
    matching=""
    for f in $(ls "$snapdir"/*.json 2>/dev/null | sort); do
        if [ -n "$tag" ]; then grep -q "\"$tag\"" "$f" || continue; fi
        matching="$matching $f"
    done
    total=$(echo $matching | wc -w)
    keep="${keep:-0}"
    n_remove=$((total - keep))
    [ "$n_remove" -lt 0 ] && n_remove=0
    remove=""
    kept=""
    i=0
    for f in $matching; do
        i=$((i+1))
        if [ "$i" -le "$n_remove" ]; then remove="$remove $f"; else kept="$kept $f"; fi
    done
    printf '[{"keep":'
    emit_array $kept
    printf ',"remove":'
    emit_array $remove
    printf '}]\n'
    for f in $remove; do
        id="$(basename "$f" .json)"
        rm -f "$f"
        rm -rf "$datadir/$id"
    done
    ;;
restore)
    id=""
    target=""
    while [ $# -gt 0 ]; do
        case "$1" in
            --target) shift; target="$1" ;;
            --include) shift ;;
            --*) ;;
            *) id="$1" ;;
        esac
        shift
    done
    [ -d "$datadir/$id" ] || { echo "snapshot $id not found" >&2; exit 1; }
    mkdir -p "$target"
    cp -a "$datadir/$id/." "$target/"
    echo '{"message_type":"summary","total_files_processed":1}'
    ;;
stats)
    count=$(ls "$snapdir"/*.json 2>/dev/null | wc -l)
    printf '{"total_size":4096,"total_file_count":3,"snapshot_count":%s}\n' "$count"
    ;;
ls)
    echo '{"name":"data","path":"/data","type":"dir","size":0}'
    ;;
check)  echo "no errors were found" ;;
prune)  echo "repository cleaned" ;;
unlock) echo "repository unlocked" ;;
help)   echo "Usage: restic [flags] [command]" ;;
version) echo "restic 0.17.0 (scripted)" ;;
*)      echo "unknown command: $cmd" >&2; exit 1 ;;
esac
"#;

/// A complete system under test: orchestrator, operation log, log store,
/// and the scripted backup binary, all rooted in one temp directory.
pub struct TestContext {
    pub dir: tempfile::TempDir,
    pub oplog: Arc<OpLog>,
    pub logstore: LogStore,
    pub config: Arc<ConfigManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub sync: Arc<SyncBridge>,
    pub binary: std::path::PathBuf,
    shutdown: CancellationToken,
}

impl TestContext {
    /// Build and start a system under test with the given configuration.
    pub async fn new(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let binary = dir.path().join("fake-restic");
        std::fs::write(&binary, FAKE_RESTIC).expect("write fake binary");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
                .expect("chmod fake binary");
        }

        let instance = config.instance.clone();
        let config = Arc::new(
            ConfigManager::with_config(dir.path().join("config.json"), config)
                .await
                .expect("config manager"),
        );

        let pool = db::create_pool(&dir.path().join("oplog.sqlite"))
            .await
            .expect("pool");
        db::init_schema(&pool).await.expect("schema");
        let oplog = OpLog::open(pool, &instance).await.expect("oplog");

        let logstore = LogStore::new(dir.path().join("tasklogs")).expect("logstore");
        let sync = Arc::new(SyncBridge::new(Arc::clone(&oplog)));

        let orchestrator = Orchestrator::new(
            Arc::clone(&oplog),
            logstore.clone(),
            Arc::clone(&config),
            binary.clone(),
            Arc::new(SystemClock),
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&orchestrator).run(shutdown.clone()));

        Self {
            dir,
            oplog,
            logstore,
            config,
            orchestrator,
            sync,
            binary,
            shutdown,
        }
    }

    /// Shared state as the HTTP handlers see it.
    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.config),
            Arc::clone(&self.oplog),
            self.logstore.clone(),
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.sync),
            self.binary.clone(),
        )
    }

    /// Run a plan's backup and wait for the backup task to finish.
    pub async fn backup(&self, plan_id: &str) -> Result<i64, String> {
        let rx = self.backup_async(plan_id);
        rx.await.unwrap_or_else(|_| Err("task dropped".into()))
    }

    /// Kick off a backup without waiting.
    pub fn backup_async(
        &self,
        plan_id: &str,
    ) -> tokio::sync::oneshot::Receiver<Result<i64, String>> {
        let cfg = self.config.get();
        let plan = cfg.plan(plan_id).expect("plan exists");
        let repo = cfg.repo(&plan.repo).expect("repo exists");
        let (task, rx) = Task::new(
            TaskKind::Backup {
                plan_id: plan_id.to_string(),
            },
            &repo.guid,
            plan_id,
            Utc::now(),
        )
        .interactive();
        self.orchestrator.enqueue(task);
        rx
    }

    /// All operations, ascending id order.
    pub async fn operations(&self) -> Vec<Operation> {
        self.oplog.query(&OpSelector::all()).await.expect("query")
    }

    /// Poll the operation log until the predicate holds, panicking after
    /// the deadline.
    pub async fn wait_for(
        &self,
        what: &str,
        mut pred: impl FnMut(&[Operation]) -> bool,
    ) -> Vec<Operation> {
        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        loop {
            let ops = self.operations().await;
            if pred(&ops) {
                return ops;
            }
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {}; operations: {:#?}", what, ops);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Path of the fake repository's snapshot records.
    pub fn snapshot_count(&self, repo_uri: &std::path::Path) -> usize {
        std::fs::read_dir(repo_uri.join("snapshots"))
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A repo rooted in the test's temp directory.
pub fn test_repo(dir: &std::path::Path) -> Repo {
    let uri = dir.join("repo");
    std::fs::create_dir_all(&uri).expect("repo dir");
    Repo {
        id: "local".into(),
        guid: format!("guid-{}", uri.display()).replace('/', "-"),
        uri: uri.to_string_lossy().into_owned(),
        password: "test".into(),
        flags: vec!["--no-cache".into()],
        ..Default::default()
    }
}

/// A plan over the given data directory, schedule disabled so tests drive
/// every run explicitly.
pub fn test_plan(id: &str, data_dir: &std::path::Path, retention: RetentionPolicy) -> Plan {
    std::fs::create_dir_all(data_dir).expect("data dir");
    Plan {
        id: id.into(),
        repo: "local".into(),
        paths: vec![data_dir.to_string_lossy().into_owned()],
        schedule: SchedulePolicy::disabled(),
        retention,
        ..Default::default()
    }
}

/// A config with one repo and the given plans.
pub fn test_config(instance: &str, repo: Repo, plans: Vec<Plan>) -> Config {
    Config {
        modno: 1234,
        instance: instance.into(),
        repos: vec![repo],
        plans,
    }
}
