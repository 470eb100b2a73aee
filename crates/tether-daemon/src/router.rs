//! The central fusion point. Merges Tailer and Hub events into a
//! single ordered stream per session, deduplicates across sources,
//! arbitrates permission requests (including YOLO and structured
//! questions), and exposes the upward event interface to the chat
//! adapter via `tether_core::OutputPort`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tether_core::hash::pty_dedup_key;
use tether_core::{LruHashSet, OutputPort, PendingPermissions, PendingQuestionAggregator};
use tether_core::port::{PermissionRequest as PortPermissionRequest, StructuredQuestion, ToolCall, ToolResult};
use tether_types::{PermissionDecision, SessionRecord, SessionStatus, ThreadBinding};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::registry::Registry;
use crate::rpc_hub::{HubEvent, RpcHub};
use crate::supervisor::Supervisor;
use crate::tailer::TailerEvent;

const PTY_DEDUP_CAP: usize = 10_000;
const ASK_USER_TOOL_NAME: &str = "AskUserQuestion";

struct PendingQuestion {
    request_id: String,
    aggregator: PendingQuestionAggregator,
}

pub struct Router {
    registry: Arc<Registry>,
    hub: Arc<RpcHub>,
    supervisor: Arc<Supervisor>,
    output: Arc<dyn OutputPort>,
    state_root: PathBuf,

    message_dedup: Mutex<LruHashSet<String>>,
    pending_permissions: Mutex<PendingPermissions>,
    pending_questions: Mutex<HashMap<String, PendingQuestion>>,
    yolo: Mutex<HashSet<String>>,
    emitted_starts: Mutex<HashSet<String>>,
    emitted_ends: Mutex<HashSet<String>>,
    tailer_handles: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        hub: Arc<RpcHub>,
        supervisor: Arc<Supervisor>,
        output: Arc<dyn OutputPort>,
        state_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            hub,
            supervisor,
            output,
            state_root,
            message_dedup: Mutex::new(LruHashSet::new(PTY_DEDUP_CAP)),
            pending_permissions: Mutex::new(PendingPermissions::new()),
            pending_questions: Mutex::new(HashMap::new()),
            yolo: Mutex::new(HashSet::new()),
            emitted_starts: Mutex::new(HashSet::new()),
            emitted_ends: Mutex::new(HashSet::new()),
            tailer_handles: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set_yolo(&self, session_id: &str, on: bool) {
        let mut yolo = self.yolo.lock().await;
        if on {
            yolo.insert(session_id.to_string());
        } else {
            yolo.remove(session_id);
        }
    }

    async fn is_yolo(&self, session_id: &str) -> bool {
        self.yolo.lock().await.contains(session_id)
    }

    pub async fn send_input(&self, session_id: &str, text: String) {
        self.hub.send_input(session_id, text).await;
    }

    /// Stops a runner gracefully and waits for the transition to land.
    pub async fn stop_session(&self, session_id: &str) -> tether_core::error::Result<()> {
        self.supervisor.stop_session(session_id).await
    }

    /// A decision may arrive only once per request id; later attempts
    /// are ignored.
    pub async fn send_permission_decision(&self, request_id: &str, decision: PermissionDecision) -> bool {
        self.pending_permissions.lock().await.resolve(request_id, decision)
    }

    /// Delivers the answers object for a structured-question request.
    /// Accepts either a complete answers object (finalizes
    /// immediately) or, via repeated calls to
    /// `record_question_answer`, an incrementally assembled one.
    pub async fn allow_pending_ask_user_question(&self, session_id: &str, answers: serde_json::Value) {
        let request_id = {
            let mut pending = self.pending_questions.lock().await;
            pending.remove(session_id).map(|p| p.request_id)
        };
        let Some(request_id) = request_id else {
            warn!(session = %session_id, "allow_pending_ask_user_question with no pending question");
            return;
        };
        let decision = PermissionDecision::allow_with_answers(answers);
        self.hub.send_permission_response(session_id, request_id, decision).await;
    }

    pub async fn record_question_answer(&self, session_id: &str, index: usize, answer: serde_json::Value) {
        let finalized = {
            let mut pending = self.pending_questions.lock().await;
            let Some(entry) = pending.get_mut(session_id) else {
                warn!(session = %session_id, "record_question_answer with no pending question");
                return;
            };
            entry.aggregator.record_answer(index, answer);
            entry.aggregator.try_finalize().map(|answers| (entry.request_id.clone(), answers))
        };
        if let Some((request_id, answers)) = finalized {
            self.pending_questions.lock().await.remove(session_id);
            let decision = PermissionDecision::allow_with_answers(answers);
            self.hub.send_permission_response(session_id, request_id, decision).await;
        }
    }

    async fn resolve_thread(&self, session_id: &str) -> Option<String> {
        if let Some(thread) = self.output.current_thread(session_id).await {
            return Some(thread);
        }
        let mappings: Vec<ThreadBinding> =
            tether_core::config::read_json(&tether_core::config::thread_mapping_path(&self.state_root))
                .ok()
                .flatten()
                .unwrap_or_default();
        let binding = mappings.into_iter().find(|b| b.session_id == session_id)?;
        if self.output.revive_thread(&binding.thread_id).await {
            Some(binding.thread_id)
        } else {
            None
        }
    }

    /// Drives the Hub's event stream. Each session's Tailer events are
    /// handled on their own per-session task (spawned in
    /// `on_session_start`) rather than funneled through this loop,
    /// since the Tailer is spawned only once a session is known.
    pub async fn run(self: Arc<Self>, mut hub_rx: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = hub_rx.recv().await {
            self.clone().handle_hub_event(event).await;
        }
    }

    async fn handle_tailer_event(self: Arc<Self>, event: TailerEvent) {
        match event {
            TailerEvent::NameUpdate { session_id, name } => {
                if self.registry.set_name(&session_id, name.clone()).await.is_ok() {
                    self.output.name_update(&session_id, &name).await;
                }
            }
            TailerEvent::Todos { session_id, todos } => {
                self.output.todos(&session_id, &todos).await;
            }
            TailerEvent::PlanModeChange { session_id, active } => {
                self.output.plan_mode_change(&session_id, active).await;
            }
            TailerEvent::ToolCall { session_id, id, name, input } => {
                self.output.tool_call(&session_id, ToolCall { id, name, input }).await;
            }
            TailerEvent::ToolResult { session_id, id, text, is_error } => {
                self.output.tool_result(&session_id, ToolResult { id, content: text, is_error }).await;
            }
            TailerEvent::Message { session_id, role, text, .. } => {
                self.emit_deduped_message(&session_id, &role, &text).await;
            }
            TailerEvent::StatusPromote { session_id, status } => {
                let _ = self.registry.set_status(&session_id, status).await;
            }
        }
    }

    /// First arrival wins, regardless of source: the Tailer and the
    /// Hub's `pty_output` fallback share one dedup set keyed by
    /// `pty:<sessionId>:<hash>`.
    async fn emit_deduped_message(&self, session_id: &str, role: &str, text: &str) {
        let key = pty_dedup_key(session_id, text);
        let duplicate = self.message_dedup.lock().await.check_and_insert(key);
        if duplicate {
            return;
        }
        match self.resolve_thread(session_id).await {
            Some(_) => self.output.message(session_id, role, text).await,
            None => warn!(session = %session_id, "dropping message, no resolvable chat thread"),
        }
    }

    async fn handle_hub_event(self: Arc<Self>, event: HubEvent) {
        match event {
            HubEvent::SessionStart { id, project_dir, cwd, command, name, jsonl_file, pid } => {
                self.clone().on_session_start(id, project_dir, cwd, command, name, jsonl_file, pid).await;
            }
            HubEvent::SessionEnd { session_id } => {
                self.on_session_end(&session_id).await;
            }
            HubEvent::TitleUpdate { session_id, title } => {
                self.output.title_change(&session_id, &title).await;
            }
            HubEvent::PtyOutput { session_id, content, .. } => {
                self.emit_deduped_message(&session_id, "assistant", &content).await;
            }
            HubEvent::PermissionRequest { request_id, session_id, tool_name, tool_input } => {
                self.clone().arbitrate_permission(request_id, session_id, tool_name, tool_input).await;
            }
            HubEvent::PermissionResponse { .. } => {
                // Not currently used: the Hub itself is the decider.
            }
        }
    }

    async fn on_session_start(self: Arc<Self>, id: String, project_dir: String, cwd: String, command: Vec<String>, name: String, jsonl_file: String, pid: u32) {
        if self.registry.is_reconciling(&id).await {
            info!(session = %id, "ignoring late connection for a session under reconciliation");
            return;
        }

        match self.registry.get(&id).await {
            Some(_) => {
                let _ = self.registry.set_pid(&id, pid).await;
            }
            None => {
                let mut record = SessionRecord::new_starting(id.clone(), cwd, project_dir.clone(), command);
                record.pid = pid;
                record.name = name;
                self.registry.upsert(record).await;
            }
        }
        let _ = self.registry.set_status(&id, SessionStatus::Running).await;

        let first_start = self.emitted_starts.lock().await.insert(id.clone());
        if first_start {
            self.output.session_start(&id).await;
        }

        let jsonl_path = PathBuf::from(&project_dir).join(&jsonl_file);
        let state = crate::tailer::TailerState::new(id.clone(), jsonl_path, chrono::Utc::now());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = crate::tailer::spawn(state, tx);
        self.tailer_handles.lock().await.insert(id.clone(), handle);

        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                this.clone().handle_tailer_event(event).await;
            }
        });
    }

    async fn on_session_end(&self, session_id: &str) {
        if let Some(handle) = self.tailer_handles.lock().await.remove(session_id) {
            handle.abort();
        }
        let _ = self.registry.set_status(session_id, SessionStatus::Stopped).await;

        let pending_ids: Vec<String> = vec![session_id.to_string()];
        self.pending_permissions.lock().await.cancel_all_for(&pending_ids);
        self.pending_questions.lock().await.remove(session_id);

        let first_end = self.emitted_ends.lock().await.insert(session_id.to_string());
        if first_end {
            self.output.session_end(session_id).await;
        }
    }

    async fn arbitrate_permission(self: Arc<Self>, request_id: String, session_id: String, tool_name: String, tool_input: serde_json::Value) {
        if self.is_yolo(&session_id).await {
            self.hub.send_permission_response(&session_id, request_id, PermissionDecision::allow()).await;
            self.output
                .message(&session_id, "system", &format!("Auto-allowed via YOLO: {tool_name}"))
                .await;
            return;
        }

        if tool_name == ASK_USER_TOOL_NAME {
            let questions = tool_input.get("questions").cloned().unwrap_or_else(|| tool_input.clone());
            let total = questions.as_array().map(|a| a.len()).unwrap_or(0);
            self.pending_questions.lock().await.insert(
                session_id.clone(),
                PendingQuestion {
                    request_id: request_id.clone(),
                    aggregator: PendingQuestionAggregator::new(session_id.clone(), total),
                },
            );
            self.output
                .structured_question(StructuredQuestion { request_id, session_id, questions })
                .await;
            return;
        }

        if self.resolve_thread(&session_id).await.is_none() {
            warn!(session = %session_id, "permission request with no resolvable thread, falling back to allow");
            self.hub.send_permission_response(&session_id, request_id, PermissionDecision::allow()).await;
            return;
        }

        let rx = self.pending_permissions.lock().await.register(request_id.clone());
        let output = self.output.clone();
        let this = self.clone();
        let port_request = PortPermissionRequest {
            request_id: request_id.clone(),
            session_id: session_id.clone(),
            tool_name,
            tool_input,
        };
        tokio::spawn(async move {
            // Run the adapter call in its own task so a panic inside it
            // surfaces as a `JoinError` here instead of silently
            // dropping the permission response this task owes.
            let adapter_call = tokio::spawn(async move { output.permission_request(port_request).await });
            let decision = tokio::select! {
                joined = adapter_call => match joined {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "permission adapter panicked");
                        PermissionDecision::deny("Error processing request")
                    }
                },
                Ok(decision) = rx => decision,
            };
            this.pending_permissions.lock().await.cancel(&request_id);
            this.hub.send_permission_response(&session_id, request_id, decision).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::tempdir;
    use tether_core::port::{PermissionRequest as PR, StructuredQuestion as SQ};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
    use tokio::net::UnixStream;

    #[derive(Default)]
    struct RecordingAdapter {
        messages: StdMutex<Vec<(String, String, String)>>,
        threads: StdMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl OutputPort for RecordingAdapter {
        async fn session_start(&self, _session_id: &str) {}
        async fn session_end(&self, _session_id: &str) {}
        async fn name_update(&self, _session_id: &str, _name: &str) {}
        async fn status_change(&self, _session_id: &str, _status: SessionStatus) {}
        async fn title_change(&self, _session_id: &str, _title: &str) {}
        async fn message(&self, session_id: &str, role: &str, text: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((session_id.to_string(), role.to_string(), text.to_string()));
        }
        async fn todos(&self, _session_id: &str, _todos: &serde_json::Value) {}
        async fn tool_call(&self, _session_id: &str, _call: ToolCall) {}
        async fn tool_result(&self, _session_id: &str, _result: ToolResult) {}
        async fn plan_mode_change(&self, _session_id: &str, _active: bool) {}
        async fn permission_request(&self, _request: PR) -> PermissionDecision {
            PermissionDecision::allow()
        }
        async fn structured_question(&self, _question: SQ) {}
        async fn current_thread(&self, session_id: &str) -> Option<String> {
            self.threads.lock().unwrap().get(session_id).cloned()
        }
        async fn revive_thread(&self, _thread_id: &str) -> bool {
            true
        }
        async fn notify_session_lost(&self, _thread_id: &str) {}
    }

    fn make_router(dir: &std::path::Path, adapter: Arc<RecordingAdapter>) -> (Arc<Router>, Arc<Registry>, Arc<RpcHub>) {
        let registry = Arc::new(Registry::new(dir));
        let (hub_tx, _hub_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(RpcHub::new(dir.join("daemon.sock"), hub_tx));
        let supervisor = Arc::new(Supervisor::new(registry.clone(), false));
        let router = Router::new(registry.clone(), hub.clone(), supervisor, adapter, dir.to_path_buf());
        (router, registry, hub)
    }

    #[tokio::test]
    async fn duplicate_message_across_sources_is_suppressed() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(RecordingAdapter::default());
        adapter.threads.lock().unwrap().insert("A".into(), "T1".into());
        let (router, _registry, _hub) = make_router(dir.path(), adapter.clone());

        router.emit_deduped_message("A", "assistant", "hi").await;
        router.emit_deduped_message("A", "assistant", "hi").await;

        assert_eq!(adapter.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_with_no_resolvable_thread_is_dropped() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(RecordingAdapter::default());
        let (router, _registry, _hub) = make_router(dir.path(), adapter.clone());

        router.emit_deduped_message("A", "assistant", "hi").await;
        assert!(adapter.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn structured_question_waits_for_all_answers() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(RecordingAdapter::default());
        let (router, registry, hub) = make_router(dir.path(), adapter.clone());
        registry.upsert(SessionRecord::new_starting("A".into(), "/w".into(), "/p".into(), vec!["claude".into()])).await;

        router.clone().arbitrate_permission(
            "r1".into(),
            "A".into(),
            "AskUserQuestion".into(),
            serde_json::json!({"questions": ["q0", "q1"]}),
        ).await;

        assert!(!hub.is_bound("A").await);
        router.record_question_answer("A", 0, serde_json::json!("yes")).await;
        router.record_question_answer("A", 1, serde_json::json!("no")).await;
        // both answers recorded; no socket is bound in this test so the
        // final send_permission_response is a no-op, but it must not panic
        // and the pending entry must be cleared.
        assert!(router.pending_questions.lock().await.get("A").is_none());
    }

    #[tokio::test]
    async fn yolo_session_auto_allows_and_notifies() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(RecordingAdapter::default());
        let (router, _registry, _hub) = make_router(dir.path(), adapter.clone());
        router.set_yolo("A", true).await;

        router.clone().arbitrate_permission(
            "r1".into(),
            "A".into(),
            "Bash".into(),
            serde_json::json!({"command": "ls"}),
        ).await;

        let messages = adapter.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, "system");
    }

    #[derive(Default)]
    struct PanickingAdapter;

    #[async_trait]
    impl OutputPort for PanickingAdapter {
        async fn session_start(&self, _session_id: &str) {}
        async fn session_end(&self, _session_id: &str) {}
        async fn name_update(&self, _session_id: &str, _name: &str) {}
        async fn status_change(&self, _session_id: &str, _status: SessionStatus) {}
        async fn title_change(&self, _session_id: &str, _title: &str) {}
        async fn message(&self, _session_id: &str, _role: &str, _text: &str) {}
        async fn todos(&self, _session_id: &str, _todos: &serde_json::Value) {}
        async fn tool_call(&self, _session_id: &str, _call: ToolCall) {}
        async fn tool_result(&self, _session_id: &str, _result: ToolResult) {}
        async fn plan_mode_change(&self, _session_id: &str, _active: bool) {}
        async fn permission_request(&self, _request: PR) -> PermissionDecision {
            panic!("adapter blew up");
        }
        async fn structured_question(&self, _question: SQ) {}
        async fn current_thread(&self, _session_id: &str) -> Option<String> {
            Some("T1".into())
        }
        async fn revive_thread(&self, _thread_id: &str) -> bool {
            true
        }
        async fn notify_session_lost(&self, _thread_id: &str) {}
    }

    #[tokio::test]
    async fn permission_adapter_panic_still_emits_a_deny_response() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        let (hub_tx, _hub_rx) = mpsc::unbounded_channel();
        let socket_path = dir.path().join("daemon.sock");
        let hub = Arc::new(RpcHub::new(socket_path.clone(), hub_tx));
        let hub_serve = hub.clone();
        tokio::spawn(async move {
            let _ = hub_serve.bind_and_serve().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let start = r#"{"type":"session_start","id":"A","projectDir":"/p","cwd":"/w","command":["claude"],"name":"claude","jsonlFile":"A.jsonl","pid":1}"#;
        write_half.write_all(start.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let supervisor = Arc::new(Supervisor::new(registry.clone(), false));
        let router = Router::new(registry, hub, supervisor, Arc::new(PanickingAdapter), dir.path().to_path_buf());
        router
            .clone()
            .arbitrate_permission("r1".into(), "A".into(), "Bash".into(), serde_json::json!({"command": "ls"}))
            .await;

        let mut lines = TokioBufReader::new(read_half).lines();
        let line = tokio::time::timeout(Duration::from_millis(500), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match serde_json::from_str::<tether_types::ServerFrame>(&line).unwrap() {
            tether_types::ServerFrame::PermissionResponse { decision, .. } => {
                assert_eq!(decision.message.as_deref(), Some("Error processing request"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
