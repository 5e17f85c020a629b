//! Declarative configuration manager: validated reads and compare-and-set
//! writes with atomic persistence and change notification.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::error::{AppError, Result};
use crate::models::config::Config;

/// Holds the current declarative configuration. Writers must present the
/// modno they read; a stale modno fails the write. Every accepted write is
/// persisted via write-tmp + rename before subscribers are notified.
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    tx: watch::Sender<Arc<Config>>,
}

impl ConfigManager {
    /// Load the configuration from disk, creating a default one (with the
    /// given instance id) if the file does not exist yet.
    pub async fn load(path: impl Into<PathBuf>, default_instance: &str) -> Result<Self> {
        let path = path.into();
        let config = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let config: Config = serde_json::from_slice(&bytes)
                    .map_err(|e| AppError::Config(format!("cannot parse {:?}: {}", path, e)))?;
                config.validate()?;
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config {
                    modno: 0,
                    instance: default_instance.to_string(),
                    repos: Vec::new(),
                    plans: Vec::new(),
                };
                persist(&path, &config).await?;
                config
            }
            Err(e) => {
                return Err(AppError::Config(format!("cannot read {:?}: {}", path, e)))
            }
        };

        let current = Arc::new(config);
        let (tx, _) = watch::channel(Arc::clone(&current));
        Ok(Self {
            path,
            current: RwLock::new(current),
            tx,
        })
    }

    /// In-memory manager for tests and embedded use; writes go to the given
    /// path as usual.
    pub async fn with_config(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let path = path.into();
        config.validate()?;
        persist(&path, &config).await?;
        let current = Arc::new(config);
        let (tx, _) = watch::channel(Arc::clone(&current));
        Ok(Self {
            path,
            current: RwLock::new(current),
            tx,
        })
    }

    /// The current configuration snapshot.
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().expect("config lock poisoned"))
    }

    /// Subscribe to configuration changes. The receiver holds the snapshot
    /// current at subscription time.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Validate and install a new configuration. The caller's `modno` must
    /// match the current one; the stored config carries `modno + 1`.
    pub async fn set(&self, mut new: Config) -> Result<Arc<Config>> {
        new.validate()?;

        let expected = self.get().modno;
        if new.modno != expected {
            return Err(AppError::Conflict(format!(
                "stale config modno {} (current is {})",
                new.modno, expected
            )));
        }
        new.modno = expected + 1;

        persist(&self.path, &new).await?;

        let installed = Arc::new(new);
        *self.current.write().expect("config lock poisoned") = Arc::clone(&installed);
        let _ = self.tx.send(Arc::clone(&installed));

        tracing::info!(modno = installed.modno, "configuration updated");
        Ok(installed)
    }
}

/// Write the config to a temp file in the same directory, fsync, then
/// rename over the destination.
async fn persist(path: &PathBuf, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(config)?;
    tokio::fs::write(&tmp, &bytes).await?;
    let file = tokio::fs::File::open(&tmp).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
