//! The persistent record of supervised sessions.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tether_core::config;
use tether_core::error::{RelayError, Result};
use tether_types::{RegistryDocument, SessionRecord, SessionStatus};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

type StatusChangeCallback = Arc<dyn Fn(&str, SessionStatus, SessionStatus) + Send + Sync>;

pub struct Registry {
    path: PathBuf,
    entries: RwLock<std::collections::HashMap<String, SessionRecord>>,
    /// In-memory fence: session ids whose shutdown is in progress.
    /// Late connections for fenced ids are ignored.
    reconciling: RwLock<HashSet<String>>,
    on_status_change: RwLock<Option<StatusChangeCallback>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    NonTerminal,
    Status(SessionStatus),
}

impl Registry {
    pub fn new(state_root: &std::path::Path) -> Self {
        Self {
            path: config::registry_path(state_root),
            entries: RwLock::new(std::collections::HashMap::new()),
            reconciling: RwLock::new(HashSet::new()),
            on_status_change: RwLock::new(None),
        }
    }

    /// Loads the on-disk registry document, if present, into memory.
    pub async fn load(&self) -> Result<()> {
        if let Some(doc) = config::read_json::<RegistryDocument>(&self.path)? {
            let mut entries = self.entries.write().await;
            for record in doc.entries {
                entries.insert(record.id.clone(), record);
            }
        }
        Ok(())
    }

    pub async fn set_status_change_callback(&self, cb: StatusChangeCallback) {
        *self.on_status_change.write().await = Some(cb);
    }

    async fn write_through(&self) {
        let entries = self.entries.read().await;
        let doc = RegistryDocument {
            version: 1,
            entries: entries.values().cloned().collect(),
        };
        drop(entries);
        if let Err(e) = config::atomic_write_json(&self.path, &doc) {
            error!(error = %e, "registry disk write failed, retaining in-memory state");
        }
    }

    pub async fn upsert(&self, session: SessionRecord) {
        {
            let mut entries = self.entries.write().await;
            entries.insert(session.id.clone(), session);
        }
        self.write_through().await;
    }

    pub async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn set_status(&self, id: &str, new: SessionStatus) -> Result<()> {
        let old = {
            let mut entries = self.entries.write().await;
            let record = entries
                .get_mut(id)
                .ok_or_else(|| RelayError::NotFound(format!("session {id} not found")))?;
            let old = record.status;
            record.status = new;
            record.last_verified_at = chrono::Utc::now();
            old
        };
        self.write_through().await;
        if old != new {
            info!(session = id, ?old, ?new, "session status changed");
            if let Some(cb) = self.on_status_change.read().await.as_ref() {
                cb(id, old, new);
            }
        }
        Ok(())
    }

    pub async fn set_name(&self, id: &str, name: String) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            let record = entries
                .get_mut(id)
                .ok_or_else(|| RelayError::NotFound(format!("session {id} not found")))?;
            record.name = name;
        }
        self.write_through().await;
        Ok(())
    }

    pub async fn set_pid(&self, id: &str, pid: u32) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            let record = entries
                .get_mut(id)
                .ok_or_else(|| RelayError::NotFound(format!("session {id} not found")))?;
            record.pid = pid;
        }
        self.write_through().await;
        Ok(())
    }

    pub async fn set_thread(&self, id: &str, thread_id: Option<String>, channel_id: Option<String>) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            let record = entries
                .get_mut(id)
                .ok_or_else(|| RelayError::NotFound(format!("session {id} not found")))?;
            record.thread_id = thread_id;
            record.channel_id = channel_id;
        }
        self.write_through().await;
        Ok(())
    }

    pub async fn remove(&self, id: &str) {
        {
            let mut entries = self.entries.write().await;
            entries.remove(id);
        }
        self.write_through().await;
    }

    pub async fn list(&self, filter: StatusFilter) -> Vec<SessionRecord> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|r| match filter {
                StatusFilter::All => true,
                StatusFilter::NonTerminal => !r.status.is_terminal(),
                StatusFilter::Status(s) => r.status == s,
            })
            .cloned()
            .collect()
    }

    pub async fn mark_reconciling(&self, id: &str) {
        self.reconciling.write().await.insert(id.to_string());
    }

    pub async fn unmark_reconciling(&self, id: &str) {
        self.reconciling.write().await.remove(id);
    }

    pub async fn is_reconciling(&self, id: &str) -> bool {
        self.reconciling.read().await.contains(id)
    }

    /// Prunes terminal records older than the given retention window.
    pub async fn prune_terminal_older_than(&self, retention: chrono::Duration) {
        let cutoff = chrono::Utc::now() - retention;
        let stale: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|r| r.status.is_terminal() && r.last_verified_at < cutoff)
                .map(|r| r.id.clone())
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        {
            let mut entries = self.entries.write().await;
            for id in &stale {
                entries.remove(id);
            }
        }
        warn!(count = stale.len(), "pruned aged-out terminal sessions");
        self.write_through().await;
    }
}
