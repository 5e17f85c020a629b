//! Hook pipeline: evaluates configured hooks for a lifecycle condition,
//! runs shell commands or HTTP notifiers, and applies each hook's failure
//! policy.
//!
//! Hooks run synchronously inside the runner's context, in declared order.
//! Every triggered hook produces a RunHook operation in the triggering
//! operation's flow.

use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::clock::RetryPolicy;
use crate::error::{AppError, Result};
use crate::models::hook::{Hook, HookAction, HookCondition, HookOnError};
use crate::models::operation::{Operation, OperationPayload, OperationStatus};
use crate::services::logstore_service::LogStore;
use crate::services::oplog_service::OpLog;
use crate::services::restic_service::ENV_ALLOWLIST;

/// Overall deadline for one notifier call, retries included.
const NOTIFIER_DEADLINE: Duration = Duration::from_secs(30);

/// Values available to hook templates. The expander resolves only these
/// names; the process environment is never reachable.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub event: String,
    pub repo_id: String,
    pub plan_id: String,
    pub snapshot_id: String,
    pub error: String,
    /// JSON of the triggering operation's summary, if any.
    pub summary: String,
    /// RFC 3339 start time of the triggering operation.
    pub start_time: String,
    pub duration_ms: i64,
    pub size_bytes: u64,
}

impl HookContext {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "event" => Some(self.event.clone()),
            "repo_id" => Some(self.repo_id.clone()),
            "plan_id" => Some(self.plan_id.clone()),
            "snapshot_id" => Some(self.snapshot_id.clone()),
            "error" => Some(self.error.clone()),
            "summary" => Some(self.summary.clone()),
            "start_time" => Some(self.start_time.clone()),
            "duration" => Some(format_duration(self.duration_ms)),
            "size_bytes" => Some(format_size(self.size_bytes)),
            _ => None,
        }
    }
}

/// Expand a hook template against the context.
///
/// Syntax: `{{name}}` or `{{name|filter}}` where filter is `shell` (single
/// quote escaping) or `json` (JSON string literal). Unknown names and
/// filters are errors.
pub fn expand_template(template: &str, ctx: &HookContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            AppError::Validation(format!("unterminated placeholder in template '{}'", template))
        })?;
        let inner = after[..end].trim();

        let (name, filter) = match inner.split_once('|') {
            Some((n, f)) => (n.trim(), Some(f.trim())),
            None => (inner, None),
        };
        let value = ctx.lookup(name).ok_or_else(|| {
            AppError::Validation(format!("unknown template variable '{}'", name))
        })?;
        let rendered = match filter {
            None => value,
            Some("shell") => shell_escape(&value),
            Some("json") => serde_json::to_string(&value)?,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "unknown template filter '{}'",
                    other
                )))
            }
        };
        out.push_str(&rendered);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Check a template without rendering real values; used by config
/// validation.
pub fn validate_template(template: &str) -> Result<()> {
    expand_template(template, &HookContext::default()).map(|_| ())
}

/// Single-quote a value for safe interpolation into `sh -c` scripts.
pub fn shell_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Humanize a millisecond duration, e.g. "1h3m" or "42s".
pub fn format_duration(ms: i64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Humanize a byte count, e.g. "1.5 GB".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// What the pipeline tells the surrounding task to do after a condition has
/// been evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// All hooks passed (or failed with IGNORE); the task continues.
    Continue,
    /// A failing CANCEL hook: terminate the task as USER_CANCELLED.
    Cancel,
    /// A failing FATAL hook: terminate the task as ERROR.
    Fatal,
    /// A failing RETRY hook: requeue the task after the delay.
    Retry(Duration),
}

/// Executes hook pipelines for the runner.
pub struct HookExecutor {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl Default for HookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HookExecutor {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            retry: RetryPolicy::notifier(),
        }
    }

    /// Evaluate all hooks subscribed to `condition`, in declared order. The
    /// `base` operation provides flow and target identity for the RunHook
    /// records.
    pub async fn fire(
        &self,
        condition: HookCondition,
        hooks: &[Hook],
        ctx: &HookContext,
        base: &Operation,
        oplog: &OpLog,
        logstore: &LogStore,
        cancel: &CancellationToken,
    ) -> Result<HookOutcome> {
        for hook in hooks.iter().filter(|h| h.matches(condition)) {
            let mut op = Operation::new(
                oplog.instance_id(),
                &base.repo_id,
                &base.repo_guid,
                &base.plan_id,
                chrono::Utc::now(),
                OperationPayload::RunHook {
                    name: hook.name(),
                    condition: condition.to_string(),
                    exit_code: 0,
                },
            );
            op.flow_id = base.flow_id;
            op.status = OperationStatus::InProgress;
            oplog.add(&mut op).await?;

            let result = self.run_action(hook, ctx, logstore, &mut op, cancel).await;

            match result {
                Ok(()) => {
                    op.finalize(OperationStatus::Success, chrono::Utc::now());
                    oplog.update(&mut op).await?;
                }
                Err(e) => {
                    tracing::warn!(
                        hook = %hook.name(),
                        condition = %condition,
                        error = %e,
                        "hook failed"
                    );
                    op.display_message = e.to_string();
                    op.finalize(OperationStatus::Error, chrono::Utc::now());
                    oplog.update(&mut op).await?;

                    match hook.on_error {
                        HookOnError::Ignore => continue,
                        HookOnError::Cancel => return Ok(HookOutcome::Cancel),
                        HookOnError::Fatal => return Ok(HookOutcome::Fatal),
                        HookOnError::Retry1Min => {
                            return Ok(HookOutcome::Retry(Duration::from_secs(60)))
                        }
                        HookOnError::Retry10Min => {
                            return Ok(HookOutcome::Retry(Duration::from_secs(600)))
                        }
                    }
                }
            }
        }
        Ok(HookOutcome::Continue)
    }

    async fn run_action(
        &self,
        hook: &Hook,
        ctx: &HookContext,
        logstore: &LogStore,
        op: &mut Operation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match &hook.action {
            HookAction::Command { command } => {
                self.run_command_hook(command, ctx, logstore, op, cancel).await
            }
            HookAction::Discord { webhook_url, template } => {
                let message = render_message(template, ctx)?;
                self.post_with_retry(webhook_url, json!({ "content": message }))
                    .await
            }
            HookAction::Slack { webhook_url, template } => {
                let message = render_message(template, ctx)?;
                self.post_with_retry(webhook_url, json!({ "text": message }))
                    .await
            }
            HookAction::Gotify {
                base_url,
                token,
                title_template,
                template,
            } => {
                let title = if title_template.is_empty() {
                    format!("backrest: {}", ctx.event)
                } else {
                    expand_template(title_template, ctx)?
                };
                let message = render_message(template, ctx)?;
                let url = format!(
                    "{}/message?token={}",
                    base_url.trim_end_matches('/'),
                    token
                );
                self.post_with_retry(
                    &url,
                    json!({ "title": title, "message": message, "priority": 5 }),
                )
                .await
            }
            HookAction::Shoutrrr { shoutrrr_url, template } => {
                let message = render_message(template, ctx)?;
                self.post_with_retry(shoutrrr_url, json!({ "message": message }))
                    .await
            }
            HookAction::Healthchecks { ping_url, template } => {
                let message = render_message(template, ctx)?;
                // Error conditions ping the /fail endpoint.
                let url = if ctx.error.is_empty() {
                    ping_url.clone()
                } else {
                    format!("{}/fail", ping_url.trim_end_matches('/'))
                };
                self.post_text_with_retry(&url, message).await
            }
        }
    }

    async fn run_command_hook(
        &self,
        command: &str,
        ctx: &HookContext,
        logstore: &LogStore,
        op: &mut Operation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let script = expand_template(command, ctx)?;

        let (mut writer, logref) = logstore.create().await?;
        op.logref = logref;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&script);
        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output_fut = cmd.output();
        tokio::pin!(output_fut);
        let output = tokio::select! {
            out = &mut output_fut => out?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };

        writer.write(&output.stdout).await?;
        writer.write(&output.stderr).await?;
        writer.finalize().await?;

        let exit_code = output.status.code().unwrap_or(-1);
        if let OperationPayload::RunHook { exit_code: code, .. } = &mut op.payload {
            *code = exit_code;
        }

        if !output.status.success() {
            let tail = String::from_utf8_lossy(&output.stderr);
            let tail = tail.trim();
            return Err(AppError::Hook(format!(
                "command exited with code {}{}{}",
                exit_code,
                if tail.is_empty() { "" } else { ": " },
                tail
            )));
        }
        Ok(())
    }

    async fn post_with_retry(&self, url: &str, body: serde_json::Value) -> Result<()> {
        let attempt = |_: u32| {
            let http = self.http.clone();
            let url = url.to_string();
            let body = body.clone();
            async move {
                let response = http.post(&url).json(&body).send().await?;
                response.error_for_status()?;
                Ok::<_, AppError>(())
            }
        };
        self.with_retry(attempt).await
    }

    async fn post_text_with_retry(&self, url: &str, body: String) -> Result<()> {
        let attempt = |_: u32| {
            let http = self.http.clone();
            let url = url.to_string();
            let body = body.clone();
            async move {
                let response = http.post(&url).body(body).send().await?;
                response.error_for_status()?;
                Ok::<_, AppError>(())
            }
        };
        self.with_retry(attempt).await
    }

    /// Run an HTTP attempt with exponential backoff under the overall
    /// notifier deadline.
    async fn with_retry<F, Fut>(&self, mut attempt: F) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let retry = self.retry.clone();
        let run = async move {
            let mut last_err = None;
            for n in 0..retry.max_attempts {
                if n > 0 {
                    tokio::time::sleep(retry.delay_for(n - 1)).await;
                }
                match attempt(n).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| AppError::Hook("notifier failed".into())))
        };
        match tokio::time::timeout(NOTIFIER_DEADLINE, run).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Hook("notifier deadline exceeded".into())),
        }
    }
}

/// Notifier templates default to a compact event line when unset.
fn render_message(template: &str, ctx: &HookContext) -> Result<String> {
    if template.is_empty() {
        let mut message = format!("{} plan={} repo={}", ctx.event, ctx.plan_id, ctx.repo_id);
        if !ctx.snapshot_id.is_empty() {
            message.push_str(&format!(" snapshot={}", ctx.snapshot_id));
        }
        if !ctx.error.is_empty() {
            message.push_str(&format!(" error={}", ctx.error));
        }
        return Ok(message);
    }
    expand_template(template, ctx)
}
