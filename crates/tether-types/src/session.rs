//! Session records, the registry/thread-mapping/settings on-disk
//! schemas, and the lifecycle status enum.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Orphaned,
}

impl SessionStatus {
    /// A session in a terminal state is eligible for retention-based
    /// pruning: it will not transition further on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Orphaned)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStrategy {
    Background,
    TerminalAttached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub working_dir: String,
    pub project_dir: String,
    /// 0 means unknown or externally started.
    pub pid: u32,
    pub command: Vec<String>,
    pub name: String,
    pub status: SessionStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_verified_at: chrono::DateTime<chrono::Utc>,
    pub thread_id: Option<String>,
    pub channel_id: Option<String>,
    pub terminal_window_ref: Option<String>,
}

impl SessionRecord {
    pub fn new_starting(id: String, working_dir: String, project_dir: String, command: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        let name = command.first().cloned().unwrap_or_default();
        Self {
            id,
            working_dir,
            project_dir,
            pid: 0,
            command,
            name,
            status: SessionStatus::Starting,
            started_at: now,
            last_verified_at: now,
            thread_id: None,
            channel_id: None,
            terminal_window_ref: None,
        }
    }
}

/// `{ version:1, entries:[Session, …] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    pub entries: Vec<SessionRecord>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
        }
    }
}

/// `{ sessionId, threadId, channelId, cwd }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadBinding {
    pub session_id: String,
    pub thread_id: String,
    pub channel_id: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub default_directory: Option<String>,
    #[serde(default)]
    pub auto_cleanup_orphans: bool,
    #[serde(default)]
    pub max_concurrent_sessions: Option<u32>,
    #[serde(default)]
    pub terminal_app: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            allowed_directories: Vec::new(),
            default_directory: None,
            auto_cleanup_orphans: false,
            max_concurrent_sessions: None,
            terminal_app: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_document_round_trips() {
        let doc = RegistryDocument {
            version: 1,
            entries: vec![SessionRecord::new_starting(
                "A".into(),
                "/w".into(),
                "/p".into(),
                vec!["claude".into()],
            )],
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: RegistryDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries[0].id, "A");
        assert_eq!(back.entries[0].status, SessionStatus::Starting);
    }

    #[test]
    fn settings_default_is_not_auto_cleanup() {
        assert!(!Settings::default().auto_cleanup_orphans);
    }

    #[test]
    fn orphaned_and_stopped_are_terminal_others_are_not() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Orphaned.is_terminal());
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Stopping.is_terminal());
    }
}
