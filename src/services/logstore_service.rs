//! Keyed, append-only blob store for per-task stdout/stderr transcripts.
//!
//! Refs are opaque handles of the form `<shard>/<hex>`; the two-character
//! shard prefix keeps directory fanout bounded. Writers stream and flush to
//! disk so a crash leaves the transcript readable up to the last flush. The
//! store is faithful: display truncation is applied by consumers, never here.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

/// Suffix of the sidecar file that records a ref's expiry time in unix
/// millis.
const EXPIRY_SUFFIX: &str = ".expiry";

/// A streaming writer for one transcript.
pub struct LogWriter {
    file: fs::File,
    path: PathBuf,
}

impl LogWriter {
    /// Append bytes to the transcript.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        Ok(())
    }

    /// Flush buffered bytes and fsync; everything written so far survives a
    /// crash.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Flush, fsync and close the transcript.
    pub async fn finalize(mut self) -> Result<()> {
        self.flush().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The on-disk log store rooted at `tasklogs/`.
#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| AppError::LogStore(format!("cannot create {:?}: {}", root, e)))?;
        Ok(Self { root })
    }

    fn ref_to_path(&self, logref: &str) -> Result<PathBuf> {
        // Refs are generated by this store; reject anything that could
        // escape the root.
        if logref.is_empty()
            || !logref
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '/')
            || logref.contains("//")
        {
            return Err(AppError::LogStore(format!("invalid logref '{}'", logref)));
        }
        Ok(self.root.join(logref))
    }

    /// Create a new transcript; returns the writer and its opaque ref.
    pub async fn create(&self) -> Result<(LogWriter, String)> {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let logref = format!("{}/{}", &hex[..2], &hex[2..]);

        let path = self.root.join(&logref);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&path).await?;
        Ok((LogWriter { file, path }, logref))
    }

    /// Read a transcript in full.
    pub async fn read(&self, logref: &str) -> Result<Vec<u8>> {
        let path = self.ref_to_path(logref)?;
        fs::read(&path)
            .await
            .map_err(|e| AppError::LogStore(format!("cannot read {}: {}", logref, e)))
    }

    /// Open a transcript for streaming reads.
    pub async fn open(&self, logref: &str) -> Result<fs::File> {
        let path = self.ref_to_path(logref)?;
        fs::File::open(&path)
            .await
            .map_err(|e| AppError::LogStore(format!("cannot open {}: {}", logref, e)))
    }

    pub async fn delete(&self, logref: &str) -> Result<()> {
        let path = self.ref_to_path(logref)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::LogStore(format!("cannot delete {}: {}", logref, e)))
            }
        }
        let _ = fs::remove_file(expiry_path(&path)).await;
        Ok(())
    }

    /// Mark a ref for removal at the given time; the next sweep past that
    /// time deletes it.
    pub async fn set_expiry(&self, logref: &str, at: DateTime<Utc>) -> Result<()> {
        let path = self.ref_to_path(logref)?;
        fs::write(expiry_path(&path), at.timestamp_millis().to_string()).await?;
        Ok(())
    }

    /// Remove expired refs plus any ref not in `live` whose transcript is
    /// older than `grace`. Returns the number of transcripts removed.
    pub async fn sweep(
        &self,
        live: &HashSet<String>,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut removed = 0u64;
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().to_string();
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(EXPIRY_SUFFIX) {
                    continue;
                }
                let logref = format!("{}/{}", shard_name, name);
                let path = entry.path();

                let expired = match fs::read_to_string(expiry_path(&path)).await {
                    Ok(contents) => contents
                        .trim()
                        .parse::<i64>()
                        .map(|ms| ms <= now.timestamp_millis())
                        .unwrap_or(false),
                    Err(_) => false,
                };

                let orphaned = if live.contains(&logref) {
                    false
                } else {
                    let age = entry
                        .metadata()
                        .await
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|mtime| mtime.elapsed().ok());
                    age.is_some_and(|age| age >= grace)
                };

                if expired || orphaned {
                    self.delete(&logref).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "log store sweep removed transcripts");
        }
        Ok(removed)
    }
}

fn expiry_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(EXPIRY_SUFFIX);
    PathBuf::from(s)
}
