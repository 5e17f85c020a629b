//! Typed driver over the external backup binary.
//!
//! Each call computes an argv, launches the child with a scrubbed
//! environment, folds stderr into the transcript alongside stdout, and
//! parses the tool's line-delimited JSON progress stream where one exists.
//! The driver holds no state beyond the argv template; mutual exclusion is
//! the runner's responsibility.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::DateTime;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::operation::{BackupProgress, BackupSummary, SnapshotMeta};
use crate::models::repo::Repo;
use crate::services::logstore_service::LogWriter;

/// Environment variables forwarded to child processes (the backup tool and
/// command hooks); everything else is scrubbed. The repo's own configured
/// variables are added on top.
pub const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "TMPDIR", "XDG_CACHE_HOME"];

/// How long a SIGINT'd child gets to exit before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Bytes of combined output retained for error messages.
const ERROR_TAIL_BYTES: usize = 500;

/// Progress events parsed from a backup or restore run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Status(BackupProgress),
    Summary(BackupSummary),
}

/// Result of a completed backup run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub summary: BackupSummary,
    /// Per-item error messages the tool reported while still succeeding
    /// overall (e.g. unreadable files).
    pub errors: Vec<String>,
}

/// A snapshot as reported by the backup tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ResticSnapshot {
    pub id: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl ResticSnapshot {
    pub fn to_meta(&self) -> SnapshotMeta {
        let unix_time_ms = DateTime::parse_from_rfc3339(&self.time)
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        SnapshotMeta {
            id: self.id.clone(),
            unix_time_ms,
            tags: self.tags.clone(),
            paths: self.paths.clone(),
        }
    }

    /// Value of a `key:value` tag, e.g. `created-by:<instance>`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}:", key);
        self.tags
            .iter()
            .find_map(|t| t.strip_prefix(prefix.as_str()))
    }
}

/// One entry from `ls`.
#[derive(Debug, Clone, Deserialize, serde::Serialize, utoipa::ToSchema)]
pub struct LsEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Aggregate statistics from `stats --json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default, alias = "snapshots_count")]
    pub snapshot_count: u64,
}

#[derive(Debug)]
struct RunOutcome {
    exit_code: i32,
    cancelled: bool,
    /// Last bytes of combined output, for error messages.
    tail: String,
    /// Full stdout, for subcommands whose output is one JSON document.
    stdout: String,
}

impl RunOutcome {
    fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }
}

/// Per-repo driver instance.
pub struct ResticClient {
    binary: PathBuf,
    repo: Repo,
}

impl ResticClient {
    pub fn new(binary: impl Into<PathBuf>, repo: Repo) -> Self {
        Self {
            binary: binary.into(),
            repo,
        }
    }

    /// Build the base argv for a subcommand: global repo flags come after
    /// the operation's own arguments.
    fn build_args(&self, subcommand: &str, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + args.len() + self.repo.flags.len());
        argv.push(subcommand.to_string());
        argv.extend(args.iter().cloned());
        argv.extend(self.repo.flags.iter().cloned());
        argv
    }

    /// Build the child command with a scrubbed environment. The repo uri and
    /// password travel via environment, never argv.
    fn base_command(&self, argv: &[String]) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.binary);
        cmd.args(argv);
        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("RESTIC_REPOSITORY", &self.repo.uri);
        cmd.env("RESTIC_PASSWORD", &self.repo.password);
        for var in &self.repo.env {
            cmd.env(&var.name, &var.value);
        }
        cmd
    }

    /// Run the child to completion, streaming both output pipes into the
    /// transcript writer and handing stdout lines to `on_line`. Honors the
    /// cancellation token with SIGINT then SIGKILL after a grace period.
    async fn run(
        &self,
        argv: &[String],
        cancel: &CancellationToken,
        mut output: Option<&mut LogWriter>,
        mut on_line: impl FnMut(&str),
    ) -> Result<RunOutcome> {
        let mut cmd = tokio::process::Command::from(self.base_command(argv));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(binary = ?self.binary, args = ?argv, repo = %self.repo.id, "spawning backup tool");

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::Process(format!("failed to launch {:?}: {}", self.binary, e)))?;
        let pid = child.id();

        let mut stdout_lines =
            BufReader::new(child.stdout.take().ok_or_else(|| {
                AppError::Process("child stdout not captured".into())
            })?)
            .lines();
        let mut stderr_lines =
            BufReader::new(child.stderr.take().ok_or_else(|| {
                AppError::Process("child stderr not captured".into())
            })?)
            .lines();

        let mut stdout_buf = String::new();
        let mut tail: Vec<u8> = Vec::new();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut cancelled = false;
        let mut killed = false;
        let kill_deadline = tokio::time::sleep(Duration::from_secs(86400));
        tokio::pin!(kill_deadline);

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => match line? {
                    Some(line) => {
                        on_line(&line);
                        push_tail(&mut tail, line.as_bytes());
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                        if let Some(writer) = output.as_deref_mut() {
                            writer.write_line(&line).await?;
                        }
                    }
                    None => stdout_done = true,
                },
                line = stderr_lines.next_line(), if !stderr_done => match line? {
                    Some(line) => {
                        push_tail(&mut tail, line.as_bytes());
                        if let Some(writer) = output.as_deref_mut() {
                            writer.write_line(&line).await?;
                        }
                    }
                    None => stderr_done = true,
                },
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    if let Some(pid) = pid {
                        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT);
                    }
                    kill_deadline.as_mut().reset(tokio::time::Instant::now() + KILL_GRACE);
                }
                _ = &mut kill_deadline, if cancelled && !killed => {
                    killed = true;
                    let _ = child.start_kill();
                }
            }
        }

        let status = if cancelled {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.start_kill();
                    child.wait().await?
                }
            }
        } else {
            child.wait().await?
        };

        if let Some(writer) = output.as_deref_mut() {
            writer.flush().await?;
        }

        Ok(RunOutcome {
            exit_code: status.code().unwrap_or(-1),
            cancelled,
            tail: String::from_utf8_lossy(&tail).into_owned(),
            stdout: stdout_buf,
        })
    }

    fn check_outcome(&self, verb: &str, outcome: &RunOutcome) -> Result<()> {
        if outcome.cancelled {
            return Err(AppError::Cancelled);
        }
        if outcome.exit_code != 0 {
            return Err(AppError::Process(format!(
                "{} failed with exit code {}: {}",
                verb,
                outcome.exit_code,
                outcome.tail.trim()
            )));
        }
        Ok(())
    }

    /// Initialize the repository; an already-initialized repo is not an
    /// error.
    pub async fn init(&self, output: Option<&mut LogWriter>) -> Result<()> {
        let argv = self.build_args("init", &[]);
        let outcome = self
            .run(&argv, &CancellationToken::new(), output, |_| {})
            .await?;
        if !outcome.success() && outcome.tail.contains("already") {
            return Ok(());
        }
        self.check_outcome("init", &outcome)
    }

    /// Run a backup, forwarding progress events as they arrive. Returns the
    /// final summary.
    #[allow(clippy::too_many_arguments)]
    pub async fn backup(
        &self,
        paths: &[String],
        excludes: &[String],
        iexcludes: &[String],
        tags: &[String],
        cancel: &CancellationToken,
        output: Option<&mut LogWriter>,
        mut on_event: impl FnMut(ProgressEvent),
    ) -> Result<BackupReport> {
        let mut args: Vec<String> = vec!["--json".into()];
        args.extend(paths.iter().cloned());
        for exclude in excludes {
            args.push("--exclude".into());
            args.push(exclude.clone());
        }
        for iexclude in iexcludes {
            args.push("--iexclude".into());
            args.push(iexclude.clone());
        }
        for tag in tags {
            args.push("--tag".into());
            args.push(tag.clone());
        }
        let argv = self.build_args("backup", &args);

        let mut summary: Option<BackupSummary> = None;
        let mut errors: Vec<String> = Vec::new();
        let outcome = self
            .run(&argv, cancel, output, |line| {
                match parse_progress_line(line) {
                    Some(ProgressEvent::Summary(s)) => {
                        summary = Some(s.clone());
                        on_event(ProgressEvent::Summary(s));
                    }
                    Some(event) => on_event(event),
                    None => {
                        if let Some(message) = parse_error_line(line) {
                            errors.push(message);
                        }
                    }
                }
            })
            .await?;

        self.check_outcome("backup", &outcome)?;
        let summary = summary.ok_or_else(|| {
            AppError::Process(format!(
                "backup produced no summary: {}",
                outcome.tail.trim()
            ))
        })?;
        Ok(BackupReport { summary, errors })
    }

    /// List snapshots, optionally filtered by tag.
    pub async fn snapshots(&self, tag_filter: Option<&str>) -> Result<Vec<ResticSnapshot>> {
        let mut args: Vec<String> = vec!["--json".into()];
        if let Some(tag) = tag_filter {
            args.push("--tag".into());
            args.push(tag.to_string());
        }
        let argv = self.build_args("snapshots", &args);
        let outcome = self
            .run(&argv, &CancellationToken::new(), None, |_| {})
            .await?;
        self.check_outcome("snapshots", &outcome)?;
        parse_json_document(&outcome.stdout)
            .ok_or_else(|| AppError::Process("snapshots output is not valid JSON".into()))
    }

    /// Apply a retention policy; returns the snapshots that were removed.
    pub async fn forget(
        &self,
        policy_args: &[String],
        tag_filter: Option<&str>,
        output: Option<&mut LogWriter>,
    ) -> Result<Vec<ResticSnapshot>> {
        let mut args: Vec<String> = vec!["--json".into(), "--group-by".into(), String::new()];
        if let Some(tag) = tag_filter {
            args.push("--tag".into());
            args.push(tag.to_string());
        }
        args.extend(policy_args.iter().cloned());
        let argv = self.build_args("forget", &args);
        let outcome = self
            .run(&argv, &CancellationToken::new(), output, |_| {})
            .await?;
        self.check_outcome("forget", &outcome)?;

        let groups: Vec<ForgetGroup> = parse_json_document(&outcome.stdout)
            .ok_or_else(|| AppError::Process("forget output is not valid JSON".into()))?;
        Ok(groups.into_iter().flat_map(|g| g.remove).collect())
    }

    /// Forget specific snapshots by id.
    pub async fn forget_snapshots(
        &self,
        snapshot_ids: &[String],
        output: Option<&mut LogWriter>,
    ) -> Result<()> {
        let argv = self.build_args("forget", &snapshot_ids.to_vec());
        let outcome = self
            .run(&argv, &CancellationToken::new(), output, |_| {})
            .await?;
        self.check_outcome("forget", &outcome)
    }

    pub async fn prune(
        &self,
        max_unused_percent: f64,
        cancel: &CancellationToken,
        output: Option<&mut LogWriter>,
    ) -> Result<()> {
        let args = vec![
            "--max-unused".into(),
            format!("{}%", max_unused_percent),
        ];
        let argv = self.build_args("prune", &args);
        let outcome = self.run(&argv, cancel, output, |_| {}).await?;
        self.check_outcome("prune", &outcome)
    }

    pub async fn check(
        &self,
        read_data_percent: f64,
        cancel: &CancellationToken,
        output: Option<&mut LogWriter>,
    ) -> Result<()> {
        let mut args: Vec<String> = Vec::new();
        if read_data_percent > 0.0 {
            args.push(format!("--read-data-subset={}%", read_data_percent));
        }
        let argv = self.build_args("check", &args);
        let outcome = self.run(&argv, cancel, output, |_| {}).await?;
        self.check_outcome("check", &outcome)
    }

    pub async fn stats(&self, snapshot_id: Option<&str>) -> Result<RepoStats> {
        let mut args: Vec<String> = vec!["--json".into()];
        if let Some(id) = snapshot_id {
            args.push(id.to_string());
        }
        let argv = self.build_args("stats", &args);
        let outcome = self
            .run(&argv, &CancellationToken::new(), None, |_| {})
            .await?;
        self.check_outcome("stats", &outcome)?;
        parse_json_document(&outcome.stdout)
            .ok_or_else(|| AppError::Process("stats output is not valid JSON".into()))
    }

    /// Restore a snapshot (optionally a sub-path) into a target directory.
    pub async fn restore(
        &self,
        snapshot_id: &str,
        path: Option<&str>,
        target: &str,
        cancel: &CancellationToken,
        output: Option<&mut LogWriter>,
        mut on_event: impl FnMut(ProgressEvent),
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "--json".into(),
            snapshot_id.to_string(),
            "--target".into(),
            target.to_string(),
        ];
        if let Some(path) = path {
            args.push("--include".into());
            args.push(path.to_string());
        }
        let argv = self.build_args("restore", &args);
        let outcome = self
            .run(&argv, cancel, output, |line| {
                if let Some(event) = parse_progress_line(line) {
                    on_event(event);
                }
            })
            .await?;
        self.check_outcome("restore", &outcome)
    }

    /// List entries of a snapshot under a path prefix.
    pub async fn ls(&self, snapshot_id: &str, path: &str) -> Result<Vec<LsEntry>> {
        let mut args: Vec<String> = vec!["--json".into(), snapshot_id.to_string()];
        if !path.is_empty() {
            args.push(path.to_string());
        }
        let argv = self.build_args("ls", &args);
        let outcome = self
            .run(&argv, &CancellationToken::new(), None, |_| {})
            .await?;
        self.check_outcome("ls", &outcome)?;

        // One JSON document per line; the snapshot header lacks a path.
        let entries = outcome
            .stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<LsEntry>(line).ok())
            .filter(|entry| !entry.path.is_empty())
            .collect();
        Ok(entries)
    }

    pub async fn unlock(&self, output: Option<&mut LogWriter>) -> Result<()> {
        let argv = self.build_args("unlock", &[]);
        let outcome = self
            .run(&argv, &CancellationToken::new(), output, |_| {})
            .await?;
        self.check_outcome("unlock", &outcome)
    }

    /// Run an arbitrary subcommand of the backup tool, transcript to the
    /// writer. The command string is split on whitespace.
    pub async fn run_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
        output: Option<&mut LogWriter>,
    ) -> Result<()> {
        let parts: Vec<String> = command.split_whitespace().map(String::from).collect();
        if parts.is_empty() {
            return Err(AppError::Validation("empty command".into()));
        }
        let argv = self.build_args(&parts[0], &parts[1..]);
        let outcome = self.run(&argv, cancel, output, |_| {}).await?;
        self.check_outcome(&parts[0], &outcome)
    }
}

/// Keep only the trailing `ERROR_TAIL_BYTES` of combined output.
fn push_tail(tail: &mut Vec<u8>, line: &[u8]) {
    tail.extend_from_slice(line);
    tail.push(b'\n');
    if tail.len() > ERROR_TAIL_BYTES {
        let excess = tail.len() - ERROR_TAIL_BYTES;
        tail.drain(..excess);
    }
}

#[derive(Debug, Deserialize)]
struct ForgetGroup {
    #[serde(default)]
    remove: Vec<ResticSnapshot>,
}

/// Parse one line of the tool's JSON progress stream.
fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    match value.get("message_type")?.as_str()? {
        "status" => {
            let status: BackupProgress = serde_json::from_value(value).ok()?;
            Some(ProgressEvent::Status(status))
        }
        "summary" => {
            let summary: BackupSummary = serde_json::from_value(value).ok()?;
            Some(ProgressEvent::Summary(summary))
        }
        _ => None,
    }
}

/// Extract the message from a JSON error line, if it is one.
fn parse_error_line(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("message_type")?.as_str()? != "error" {
        return None;
    }
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("error"))
        .and_then(|m| m.as_str())
        .map(String::from)
}

/// Parse a complete JSON document out of captured stdout, tolerating stray
/// non-JSON lines before it.
fn parse_json_document<T: serde::de::DeserializeOwned>(stdout: &str) -> Option<T> {
    if let Ok(parsed) = serde_json::from_str(stdout) {
        return Some(parsed);
    }
    stdout
        .lines()
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::repo::EnvVar;

    fn test_repo() -> Repo {
        Repo {
            id: "local".into(),
            guid: "guid-1".into(),
            uri: "/tmp/repo".into(),
            password: "secret".into(),
            env: vec![EnvVar {
                name: "AWS_ACCESS_KEY_ID".into(),
                value: "abc".into(),
            }],
            flags: vec!["--no-cache".into()],
            ..Default::default()
        }
    }

    #[test]
    fn argv_places_repo_flags_last() {
        let client = ResticClient::new("/usr/bin/restic", test_repo());
        let argv = client.build_args("backup", &["--json".into(), "/data".into()]);
        assert_eq!(argv, vec!["backup", "--json", "/data", "--no-cache"]);
    }

    #[test]
    fn environment_is_scrubbed_to_allowlist() {
        std::env::set_var("BACKREST_TEST_SECRET", "leaky");
        let client = ResticClient::new("/usr/bin/restic", test_repo());
        let cmd = client.base_command(&["snapshots".into()]);

        let envs: Vec<(String, Option<String>)> = cmd
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.map(|v| v.to_string_lossy().into_owned()),
                )
            })
            .collect();

        assert!(envs.iter().any(|(k, v)| {
            k == "RESTIC_REPOSITORY" && v.as_deref() == Some("/tmp/repo")
        }));
        assert!(envs.iter().any(|(k, v)| {
            k == "RESTIC_PASSWORD" && v.as_deref() == Some("secret")
        }));
        assert!(envs.iter().any(|(k, _)| k == "AWS_ACCESS_KEY_ID"));
        assert!(!envs.iter().any(|(k, _)| k == "BACKREST_TEST_SECRET"));
        std::env::remove_var("BACKREST_TEST_SECRET");
    }

    #[test]
    fn progress_lines_parse() {
        let status = parse_progress_line(
            r#"{"message_type":"status","percent_done":0.5,"files_done":3,"bytes_done":100,"total_bytes":200,"current_files":["/a"]}"#,
        );
        match status {
            Some(ProgressEvent::Status(s)) => {
                assert_eq!(s.percent_done, 0.5);
                assert_eq!(s.files_done, 3);
                assert_eq!(s.current_files, vec!["/a"]);
            }
            other => panic!("expected status, got {:?}", other),
        }

        let summary = parse_progress_line(
            r#"{"message_type":"summary","files_new":2,"files_changed":1,"data_added":512,"total_files_processed":3,"total_bytes_processed":1024,"snapshot_id":"abcd1234"}"#,
        );
        match summary {
            Some(ProgressEvent::Summary(s)) => {
                assert_eq!(s.files_new, 2);
                assert_eq!(s.snapshot_id, "abcd1234");
            }
            other => panic!("expected summary, got {:?}", other),
        }

        assert!(parse_progress_line("plain text output").is_none());
    }

    #[test]
    fn error_lines_parse() {
        let message = parse_error_line(
            r#"{"message_type":"error","error":{"message":"permission denied"},"item":"/root/secret"}"#,
        );
        assert_eq!(message.as_deref(), Some("permission denied"));
        assert!(parse_error_line(r#"{"message_type":"status"}"#).is_none());
    }

    #[test]
    fn forget_groups_parse() {
        let stdout = r#"[{"keep":[{"id":"aaa","time":"2026-01-01T00:00:00Z"}],"remove":[{"id":"bbb","time":"2025-12-01T00:00:00Z"},{"id":"ccc","time":"2025-11-01T00:00:00Z"}]}]"#;
        let groups: Vec<ForgetGroup> = parse_json_document(stdout).unwrap();
        let removed: Vec<String> = groups
            .into_iter()
            .flat_map(|g| g.remove)
            .map(|s| s.id)
            .collect();
        assert_eq!(removed, vec!["bbb", "ccc"]);
    }

    #[test]
    fn snapshot_meta_conversion() {
        let snapshot = ResticSnapshot {
            id: "deadbeef".into(),
            time: "2026-02-01T12:00:00Z".into(),
            tags: vec!["plan:daily".into(), "created-by:inst-1".into()],
            paths: vec!["/data".into()],
        };
        let meta = snapshot.to_meta();
        assert_eq!(meta.id, "deadbeef");
        assert!(meta.unix_time_ms > 0);
        assert_eq!(snapshot.tag_value("created-by"), Some("inst-1"));
        assert_eq!(snapshot.tag_value("plan"), Some("daily"));
        assert_eq!(snapshot.tag_value("missing"), None);
    }

    #[test]
    fn tail_keeps_last_bytes() {
        let mut tail = Vec::new();
        push_tail(&mut tail, &[b'a'; 400]);
        push_tail(&mut tail, &[b'b'; 400]);
        assert_eq!(tail.len(), ERROR_TAIL_BYTES);
        assert_eq!(tail[tail.len() - 2], b'b');
    }

    #[tokio::test]
    async fn run_captures_output_and_exit_code() {
        // A scripted stand-in for the backup binary.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-restic");
        std::fs::write(
            &script,
            "#!/bin/sh\necho stdout-line\necho stderr-line >&2\nexit 3\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let client = ResticClient::new(&script, test_repo());
        let outcome = client
            .run(
                &["snapshots".into()],
                &CancellationToken::new(),
                None,
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
        assert!(outcome.tail.contains("stdout-line"));
        assert!(outcome.tail.contains("stderr-line"));
        assert!(outcome.stdout.contains("stdout-line"));
        assert!(!outcome.stdout.contains("stderr-line"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-restic");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let client = ResticClient::new(&script, test_repo());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = client
            .run(&["backup".into()], &cancel, None, |_| {})
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
