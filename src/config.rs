//! Process-level configuration loaded from environment variables.
//!
//! This is distinct from the declarative backup configuration managed by
//! [`crate::services::config_service::ConfigManager`]; everything here is
//! fixed for the lifetime of the process.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Exit code: declarative configuration failed validation.
pub const EXIT_CONFIG_INVALID: i32 = 1;
/// Exit code: backup binary missing and installation disabled.
pub const EXIT_BINARY_MISSING: i32 = 2;
/// Exit code: data directory not writable.
pub const EXIT_DATA_UNWRITABLE: i32 = 3;

/// Read an environment variable and parse it, falling back to a default on
/// missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Data root: oplog database, task logs, pinned binaries
    pub data_dir: PathBuf,

    /// Path of the declarative configuration file
    pub config_path: PathBuf,

    /// RPC listen port
    pub port: u16,

    /// Explicit path of the backup binary, overriding discovery
    pub restic_command: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let data_dir = env::var("BACKREST_DATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let config_path = env::var("BACKREST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        Self {
            data_dir,
            config_path,
            port: env_parse("BACKREST_PORT", 9898),
            restic_command: env::var("BACKREST_RESTIC_COMMAND").ok().map(PathBuf::from),
        }
    }

    /// Path of the operation log database.
    pub fn oplog_path(&self) -> PathBuf {
        self.data_dir.join("oplog.sqlite")
    }

    /// Root of the task log store.
    pub fn tasklogs_dir(&self) -> PathBuf {
        self.data_dir.join("tasklogs")
    }

    /// Directory holding last-run process stderr for diagnostics.
    pub fn processlogs_dir(&self) -> PathBuf {
        self.data_dir.join("processlogs")
    }

    /// Ensure the data directory layout exists and is writable.
    pub fn ensure_data_dir(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.tasklogs_dir(),
            self.processlogs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| AppError::Config(format!("data dir {:?} not writable: {e}", dir)))?;
        }
        let probe = self.data_dir.join(".write-probe");
        std::fs::write(&probe, b"ok")
            .map_err(|e| AppError::Config(format!("data dir {:?} not writable: {e}", self.data_dir)))?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    /// Locate the backup binary: the `BACKREST_RESTIC_COMMAND` override if
    /// set, otherwise the newest pinned `restic-<version>` under the data
    /// directory, otherwise `restic` on PATH.
    pub fn find_restic_binary(&self) -> Result<PathBuf> {
        if let Some(cmd) = &self.restic_command {
            if cmd.exists() {
                return Ok(cmd.clone());
            }
            return Err(AppError::Config(format!(
                "BACKREST_RESTIC_COMMAND {:?} does not exist",
                cmd
            )));
        }

        if let Some(pinned) = newest_pinned_binary(&self.data_dir.join("restic")) {
            return Ok(pinned);
        }

        // Fall back to a restic on PATH.
        if let Ok(path_var) = env::var("PATH") {
            for dir in env::split_paths(&path_var) {
                let candidate = dir.join("restic");
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        Err(AppError::Config(
            "no backup binary found: set BACKREST_RESTIC_COMMAND or install restic".into(),
        ))
    }
}

/// Pinned binaries are named `restic-<version>`; pick the lexically newest.
fn newest_pinned_binary(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("restic-"))
        })
        .collect();
    candidates.sort();
    candidates.pop()
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("backrest");
    }
    home_dir().join(".local/share/backrest")
}

fn default_config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("backrest/config.json");
    }
    home_dir().join(".config/backrest/config.json")
}

fn home_dir() -> PathBuf {
    env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}
