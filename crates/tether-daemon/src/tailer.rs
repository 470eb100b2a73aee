//! One logical watcher per session over `<projectDir>/<sessionId>.jsonl`.
//!
//! Combines a debounced OS file-system notifier (`notify_debouncer_mini`)
//! with a backstop poll every 2s; both paths call the same `process`
//! routine, guarded by a per-session re-entrancy flag so overlapping
//! wake-ups never race on the same bytes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use tether_core::hash::fast_hash;
use tether_core::LruHashSet;
use tether_types::event_log::{ContentItem, EventMessage, EventRecord, MessageContent};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const SEEN_LINES_CAP: usize = 10_000;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub enum TailerEvent {
    NameUpdate { session_id: String, name: String },
    Todos { session_id: String, todos: serde_json::Value },
    PlanModeChange { session_id: String, active: bool },
    ToolCall { session_id: String, id: String, name: String, input: serde_json::Value },
    ToolResult { session_id: String, id: String, text: String, is_error: bool },
    /// Candidate message; the Router applies the cross-source
    /// first-seen check before forwarding to the adapter.
    Message { session_id: String, role: String, text: String, timestamp: Option<String> },
    /// A user message promotes status to running, an assistant
    /// message promotes to idle.
    StatusPromote { session_id: String, status: tether_types::SessionStatus },
}

pub struct TailerState {
    session_id: String,
    path: PathBuf,
    offset: u64,
    seen_lines: LruHashSet<u64>,
    started_at: chrono::DateTime<chrono::Utc>,
    slug_seen: bool,
    last_todos_hash: Option<u64>,
    plan_mode_active: bool,
}

impl TailerState {
    pub fn new(session_id: String, path: PathBuf, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            session_id,
            path,
            offset: 0,
            seen_lines: LruHashSet::new(SEEN_LINES_CAP),
            started_at,
            slug_seen: false,
            last_todos_hash: None,
            plan_mode_active: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stats and reads new bytes, splits into complete lines (the
    /// trailing fragment is retained for the next cycle), and emits
    /// derived events for each.
    pub async fn process(&mut self, tx: &mpsc::UnboundedSender<TailerEvent>) {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "tailer stat failed");
                return;
            }
        };
        let len = metadata.len();
        if len <= self.offset {
            return;
        }

        let bytes = match read_range(&self.path, self.offset, len).await {
            Ok(b) => b,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "tailer read failed");
                return;
            }
        };

        let Some(last_newline) = bytes.iter().rposition(|b| *b == b'\n') else {
            // no complete line yet; nothing to advance past
            return;
        };
        let consumed = last_newline + 1;

        for line in bytes[..consumed].split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let hash = fast_hash(line);
            if self.seen_lines.check_and_insert(hash) {
                continue;
            }
            let Ok(text) = std::str::from_utf8(line) else {
                continue;
            };
            self.process_line(text, tx);
        }

        self.offset += consumed as u64;
    }

    fn process_line(&mut self, line: &str, tx: &mpsc::UnboundedSender<TailerEvent>) {
        let record: EventRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                debug!(session = %self.session_id, error = %e, "skipping malformed event-log line");
                return;
            }
        };

        if let Some(slug) = &record.slug {
            if !self.slug_seen {
                self.slug_seen = true;
                let _ = tx.send(TailerEvent::NameUpdate {
                    session_id: self.session_id.clone(),
                    name: slug.clone(),
                });
            }
        }

        if let Some(todos) = &record.todos {
            let value = serde_json::Value::Array(todos.clone());
            let hash = fast_hash(value.to_string().as_bytes());
            if self.last_todos_hash != Some(hash) {
                self.last_todos_hash = Some(hash);
                let _ = tx.send(TailerEvent::Todos {
                    session_id: self.session_id.clone(),
                    todos: value,
                });
            }
        }

        let Some(EventMessage { role, content }) = &record.message else {
            return;
        };

        if role == "user" {
            let text = content.as_plain_text();
            if text.contains("plan mode is active") && !self.plan_mode_active {
                self.plan_mode_active = true;
                let _ = tx.send(TailerEvent::PlanModeChange {
                    session_id: self.session_id.clone(),
                    active: true,
                });
            } else if text.contains("exited plan mode") && self.plan_mode_active {
                self.plan_mode_active = false;
                let _ = tx.send(TailerEvent::PlanModeChange {
                    session_id: self.session_id.clone(),
                    active: false,
                });
            }
        }

        if let MessageContent::Items(items) = content {
            for item in items {
                match item {
                    ContentItem::ToolUse { id, name, input } if role == "assistant" => {
                        let _ = tx.send(TailerEvent::ToolCall {
                            session_id: self.session_id.clone(),
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    ContentItem::ToolResult { tool_use_id, content, is_error } if role == "user" => {
                        let text = content.as_ref().map(|c| c.joined_text()).unwrap_or_default();
                        let _ = tx.send(TailerEvent::ToolResult {
                            session_id: self.session_id.clone(),
                            id: tool_use_id.clone(),
                            text,
                            is_error: *is_error,
                        });
                    }
                    _ => {}
                }
            }
        }

        if record.is_meta || record.subtype.is_some() {
            return;
        }
        if record.kind != "user" && record.kind != "assistant" {
            return;
        }
        if let Some(ts) = &record.timestamp {
            if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(ts) {
                if ts.with_timezone(&chrono::Utc) < self.started_at {
                    return;
                }
            }
        }

        let text = content.as_plain_text();
        if text.is_empty() {
            return;
        }
        let _ = tx.send(TailerEvent::Message {
            session_id: self.session_id.clone(),
            role: role.clone(),
            text,
            timestamp: record.timestamp.clone(),
        });
        let status = if role == "user" {
            tether_types::SessionStatus::Running
        } else {
            tether_types::SessionStatus::Idle
        };
        let _ = tx.send(TailerEvent::StatusPromote {
            session_id: self.session_id.clone(),
            status,
        });
    }
}

async fn read_range(path: &std::path::Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; (len - offset) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Spawns the combined notify+poll loop for one session's event log.
/// Runs until the returned handle is aborted (session end).
pub fn spawn(mut state: TailerState, tx: mpsc::UnboundedSender<TailerEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let guard = Arc::new(Mutex::new(()));
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

        let watch_path = state.path.clone();
        let watch_dir = watch_path.parent().map(|p| p.to_path_buf());
        let mut _debouncer = None;
        if let Some(dir) = watch_dir {
            let debouncer_result = new_debouncer(
                DEBOUNCE,
                move |res: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| match res {
                    Ok(events) => {
                        for event in events {
                            match event.kind {
                                DebouncedEventKind::Any if event.path == watch_path => {
                                    let _ = notify_tx.send(());
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(_) => {
                        // backstop poll picks up whatever the watcher missed
                    }
                },
            );
            match debouncer_result {
                Ok(mut debouncer) => {
                    if let Err(e) = debouncer.watcher().watch(&dir, notify::RecursiveMode::NonRecursive) {
                        warn!(error = %e, "tailer watch setup failed, relying on backstop poll only");
                    }
                    _debouncer = Some(debouncer);
                }
                Err(e) => {
                    warn!(error = %e, "tailer debouncer creation failed, relying on backstop poll only");
                }
            }
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let _permit = guard.try_lock();
                    if _permit.is_ok() {
                        state.process(&tx).await;
                    }
                }
                maybe = notify_rx.recv() => {
                    if maybe.is_none() {
                        break;
                    }
                    let _permit = guard.try_lock();
                    if _permit.is_ok() {
                        state.process(&tx).await;
                    }
                }
            }
        }
    })
}
