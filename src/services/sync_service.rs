//! Peer synchronization bridge: the read/write contract peers have with the
//! operation log.
//!
//! Outbound, peers consume `OpLog::subscribe()` plus a query for this
//! instance's own operations. Inbound, remote operations are upserted by
//! their origin identity (instance id + original id) and are never deleted
//! or scheduled from here.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::operation::Operation;
use crate::services::oplog_service::{OpEvent, OpLog, OpSelector};

/// Applies peer traffic to the local operation log and tracks which repos
/// each peer claims to hold.
pub struct SyncBridge {
    oplog: Arc<OpLog>,
    peer_repos: RwLock<HashMap<String, Vec<String>>>,
}

impl SyncBridge {
    pub fn new(oplog: Arc<OpLog>) -> Self {
        Self {
            oplog,
            peer_repos: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or update operations received from a peer. The origin
    /// `instance_id` and `original_instance_keyid` are preserved; local ids
    /// are assigned on first sight and joined on `(instance_id,
    /// original_id)` afterwards. Deletion never travels this path, and
    /// nothing received here is ever scheduled.
    pub async fn apply_remote_operations(&self, ops: Vec<Operation>) -> Result<u64> {
        let mut applied = 0u64;
        for mut incoming in ops {
            if incoming.instance_id == self.oplog.instance_id() {
                // Our own operations echoed back; the local log is
                // authoritative for those.
                continue;
            }
            if incoming.id == 0 {
                return Err(AppError::Validation(
                    "remote operation has no origin id".into(),
                ));
            }

            let original_id = incoming.id;
            match self
                .oplog
                .find_by_original(&incoming.instance_id, original_id)
                .await?
            {
                Some(existing) => {
                    incoming.id = existing.id;
                    incoming.original_id = original_id;
                    // Local flows are keyed by local ids; keep the origin's
                    // flow id as-is for cross-instance joins.
                    self.oplog.update(&mut incoming).await?;
                }
                None => {
                    incoming.id = 0;
                    incoming.original_id = original_id;
                    self.oplog.add(&mut incoming).await?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Record the set of repo guids a peer announces it holds.
    pub async fn announce_repo_list(&self, peer_id: &str, repo_guids: Vec<String>) {
        tracing::debug!(peer = peer_id, repos = repo_guids.len(), "peer announced repo list");
        self.peer_repos
            .write()
            .await
            .insert(peer_id.to_string(), repo_guids);
    }

    /// Repo guids known to be held by the given peer.
    pub async fn peer_repo_list(&self, peer_id: &str) -> Option<Vec<String>> {
        self.peer_repos.read().await.get(peer_id).cloned()
    }

    /// Subscribe to local changes for streaming to a peer; pair with
    /// [`SyncBridge::local_operations`] to avoid missing anything.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OpEvent> {
        self.oplog.subscribe()
    }

    /// All operations owned by this instance, for the initial sync sweep.
    pub async fn local_operations(&self) -> Result<Vec<Operation>> {
        self.oplog
            .query(&OpSelector {
                instance_id: Some(self.oplog.instance_id().to_string()),
                ..Default::default()
            })
            .await
    }
}
