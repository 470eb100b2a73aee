//! A connection-oriented server on a local named channel (a Unix
//! domain socket at a fixed path, removed and recreated at startup).
//! Each connection streams newline-delimited JSON frames in both
//! directions, one frame per line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_types::{ClientFrame, ServerFrame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Frames the Hub has received, handed to the Router for processing.
#[derive(Debug, Clone)]
pub enum HubEvent {
    SessionStart {
        id: String,
        project_dir: String,
        cwd: String,
        command: Vec<String>,
        name: String,
        jsonl_file: String,
        pid: u32,
    },
    SessionEnd { session_id: String },
    TitleUpdate { session_id: String, title: String },
    PtyOutput { session_id: String, content: String, timestamp: Option<String> },
    PermissionRequest { request_id: String, session_id: String, tool_name: String, tool_input: serde_json::Value },
    PermissionResponse { request_id: String, decision: tether_types::PermissionDecision },
}

struct ConnectionHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<ServerFrame>,
}

pub struct RpcHub {
    socket_path: PathBuf,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    next_generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<HubEvent>,
}

impl RpcHub {
    pub fn new(socket_path: PathBuf, events_tx: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self {
            socket_path,
            connections: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            events_tx,
        }
    }

    /// Removes the connection bound to `session_id` only if it is still
    /// the one identified by `generation` (i.e. it hasn't already been
    /// displaced by a newer `session_start` for the same id).
    async fn remove_if_current(&self, session_id: &str, generation: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(session_id).is_some_and(|c| c.generation == generation) {
            conns.remove(session_id);
            true
        } else {
            false
        }
    }

    pub async fn bind_and_serve(self: Arc<Self>) -> anyhow::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = ?self.socket_path, "rpc hub listening");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let hub = self.clone();
            tokio::spawn(async move {
                hub.handle_connection(stream).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&frame) else {
                    continue;
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut bound: Option<(String, u64)> = None;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "rpc connection read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let frame: ClientFrame = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "malformed rpc frame, skipping");
                    continue;
                }
            };

            match frame {
                ClientFrame::SessionStart { id, project_dir, cwd, command, name, jsonl_file, pid } => {
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                    {
                        let mut conns = self.connections.write().await;
                        conns.insert(id.clone(), ConnectionHandle { generation, outbound: out_tx.clone() });
                    }
                    bound = Some((id.clone(), generation));
                    let _ = self.events_tx.send(HubEvent::SessionStart {
                        id, project_dir, cwd, command, name, jsonl_file, pid,
                    });
                }
                ClientFrame::SessionEnd { session_id } => {
                    let removed = match &bound {
                        Some((id, generation)) if *id == session_id => {
                            self.remove_if_current(&session_id, *generation).await
                        }
                        _ => false,
                    };
                    if removed {
                        let _ = self.events_tx.send(HubEvent::SessionEnd { session_id });
                    }
                    break;
                }
                ClientFrame::TitleUpdate { session_id, title } => {
                    let _ = self.events_tx.send(HubEvent::TitleUpdate { session_id, title });
                }
                ClientFrame::PtyOutput { session_id, content, timestamp, .. } => {
                    let _ = self.events_tx.send(HubEvent::PtyOutput { session_id, content, timestamp });
                }
                ClientFrame::PermissionRequest { request_id, session_id, tool_name, tool_input } => {
                    let _ = self.events_tx.send(HubEvent::PermissionRequest {
                        request_id, session_id, tool_name, tool_input,
                    });
                }
                ClientFrame::PermissionResponse { request_id, decision } => {
                    let _ = self.events_tx.send(HubEvent::PermissionResponse { request_id, decision });
                }
            }
        }

        if let Some((id, generation)) = bound {
            if self.remove_if_current(&id, generation).await {
                debug!(session = %id, "rpc connection closed, emitting session-end");
                let _ = self.events_tx.send(HubEvent::SessionEnd { session_id: id });
            } else {
                debug!(session = %id, "displaced rpc connection closed, binding already superseded");
            }
        }
        writer_task.abort();
    }

    /// Writes one `input` frame, then schedules a trailing carriage
    /// return ~100ms later to commit the line in interactive prompts.
    /// Failure to write tears down the binding and surfaces session-end.
    pub async fn send_input(&self, session_id: &str, text: String) {
        let handle = {
            let conns = self.connections.read().await;
            conns.get(session_id).map(|c| (c.generation, c.outbound.clone()))
        };
        let Some((generation, outbound)) = handle else {
            warn!(session = %session_id, "send_input for unbound session");
            return;
        };
        if outbound.send(ServerFrame::Input { text }).is_err() {
            self.teardown_binding(session_id, generation).await;
            return;
        }
        let id = session_id.to_string();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if outbound.send(ServerFrame::Input { text: "\r".to_string() }).is_err() {
                let _ = events_tx.send(HubEvent::SessionEnd { session_id: id });
            }
        });
    }

    /// Delivers the resolved decision for a `permission_request` back
    /// to the runner connection bound to the session.
    pub async fn send_permission_response(
        &self,
        session_id: &str,
        request_id: String,
        decision: tether_types::PermissionDecision,
    ) {
        let handle = {
            let conns = self.connections.read().await;
            conns.get(session_id).map(|c| (c.generation, c.outbound.clone()))
        };
        let Some((generation, outbound)) = handle else {
            warn!(session = %session_id, "send_permission_response for unbound session");
            return;
        };
        if outbound
            .send(ServerFrame::PermissionResponse { request_id, decision })
            .is_err()
        {
            self.teardown_binding(session_id, generation).await;
        }
    }

    /// Tears down the binding for `session_id` only if `generation`
    /// still matches the currently-stored connection, so a failure
    /// observed against a stale outbound handle never displaces a
    /// newer connection that has since taken over the same session id.
    async fn teardown_binding(&self, session_id: &str, generation: u64) {
        if self.remove_if_current(session_id, generation).await {
            let _ = self
                .events_tx
                .send(HubEvent::SessionEnd { session_id: session_id.to_string() });
        }
    }

    pub async fn is_bound(&self, session_id: &str) -> bool {
        self.connections.read().await.contains_key(session_id)
    }
}

pub fn default_socket_path(root: &Path) -> PathBuf {
    tether_core::config::socket_path(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt as _, BufReader as TokioBufReader};

    #[tokio::test]
    async fn session_start_binds_and_session_end_unbinds() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(RpcHub::new(socket_path.clone(), events_tx));
        let hub2 = hub.clone();
        tokio::spawn(async move {
            let _ = hub2.bind_and_serve().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let start = r#"{"type":"session_start","id":"A","projectDir":"/p","cwd":"/w","command":["claude"],"name":"claude","jsonlFile":"A.jsonl","pid":1}"#;
        client.write_all(start.as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        let ev = events_rx.recv().await.unwrap();
        assert!(matches!(ev, HubEvent::SessionStart { ref id, .. } if id == "A"));
        assert!(hub.is_bound("A").await);

        drop(client);
        let ev = events_rx.recv().await.unwrap();
        assert!(matches!(ev, HubEvent::SessionEnd { ref session_id } if session_id == "A"));
    }

    #[tokio::test]
    async fn send_input_delivers_text_then_carriage_return() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(RpcHub::new(socket_path.clone(), events_tx));
        let hub2 = hub.clone();
        tokio::spawn(async move {
            let _ = hub2.bind_and_serve().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let start = r#"{"type":"session_start","id":"A","projectDir":"/p","cwd":"/w","command":["claude"],"name":"claude","jsonlFile":"A.jsonl","pid":1}"#;
        write_half.write_all(start.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.send_input("A", "hello".to_string()).await;

        let mut lines = TokioBufReader::new(read_half).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first, r#"{"type":"input","text":"hello"}"#);

        let started = tokio::time::Instant::now();
        let second = tokio::time::timeout(Duration::from_millis(500), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second, r#"{"type":"input","text":"\r"}"#);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn displaced_connection_closing_does_not_unbind_the_replacement() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(RpcHub::new(socket_path.clone(), events_tx));
        let hub2 = hub.clone();
        tokio::spawn(async move {
            let _ = hub2.bind_and_serve().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = r#"{"type":"session_start","id":"A","projectDir":"/p","cwd":"/w","command":["claude"],"name":"claude","jsonlFile":"A.jsonl","pid":1}"#;

        let mut first = UnixStream::connect(&socket_path).await.unwrap();
        first.write_all(start.as_bytes()).await.unwrap();
        first.write_all(b"\n").await.unwrap();
        assert!(matches!(events_rx.recv().await.unwrap(), HubEvent::SessionStart { .. }));

        let mut second = UnixStream::connect(&socket_path).await.unwrap();
        second.write_all(start.as_bytes()).await.unwrap();
        second.write_all(b"\n").await.unwrap();
        assert!(matches!(events_rx.recv().await.unwrap(), HubEvent::SessionStart { .. }));

        // The first (now-displaced) connection closes. It must not emit
        // session-end for, or unbind, the second connection's binding.
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hub.is_bound("A").await);

        drop(second);
        assert!(matches!(events_rx.recv().await.unwrap(), HubEvent::SessionEnd { ref session_id } if session_id == "A"));
        assert!(!hub.is_bound("A").await);
    }
}
