//! API module - HTTP handlers and shared state.

pub mod dto;
pub mod handlers;
pub mod openapi;
pub mod routes;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::services::config_service::ConfigManager;
use crate::services::logstore_service::LogStore;
use crate::services::oplog_service::OpLog;
use crate::services::scheduler_service::Orchestrator;
use crate::services::sync_service::SyncBridge;

/// How long a download token stays valid.
const DOWNLOAD_TOKEN_TTL_SECS: i64 = 3600;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigManager>,
    pub oplog: Arc<OpLog>,
    pub logstore: LogStore,
    pub orchestrator: Arc<Orchestrator>,
    pub sync: Arc<SyncBridge>,
    /// Path of the pinned backup binary, for read-only driver calls made
    /// directly from handlers.
    pub restic_binary: std::path::PathBuf,
    /// Capability tokens for unauthenticated log downloads.
    download_tokens: Arc<Mutex<HashMap<String, DownloadGrant>>>,
}

#[derive(Clone)]
struct DownloadGrant {
    op_id: i64,
    expires_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigManager>,
        oplog: Arc<OpLog>,
        logstore: LogStore,
        orchestrator: Arc<Orchestrator>,
        sync: Arc<SyncBridge>,
        restic_binary: std::path::PathBuf,
    ) -> Self {
        Self {
            config,
            oplog,
            logstore,
            orchestrator,
            sync,
            restic_binary,
            download_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mint an expiring capability token granting download access to one
    /// operation's transcript.
    pub fn issue_download_token(&self, op_id: i64) -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        let mut tokens = self.download_tokens.lock().expect("token lock");
        let now = Utc::now();
        tokens.retain(|_, grant| grant.expires_at > now);
        tokens.insert(
            token.clone(),
            DownloadGrant {
                op_id,
                expires_at: now + chrono::Duration::seconds(DOWNLOAD_TOKEN_TTL_SECS),
            },
        );
        token
    }

    /// Resolve a download token to the operation it grants access to.
    pub fn resolve_download_token(&self, token: &str) -> Option<i64> {
        let tokens = self.download_tokens.lock().expect("token lock");
        tokens
            .get(token)
            .filter(|grant| grant.expires_at > Utc::now())
            .map(|grant| grant.op_id)
    }
}
