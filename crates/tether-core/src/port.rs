//! The upward (chat-adapter) contract, expressed as a capability-set
//! trait the core depends on abstractly rather than a map of
//! callbacks. Concrete chat-platform bindings (Discord/Slack/Telegram)
//! are a separate collaborator; only the trait lives here.

use async_trait::async_trait;
use tether_types::PermissionDecision;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StructuredQuestion {
    pub request_id: String,
    pub session_id: String,
    pub questions: serde_json::Value,
}

/// Output port: events emitted outward from the core to whatever chat
/// adapter is attached. Implementors decide how (or whether) to
/// surface each event; none of these calls are suspension points the
/// core depends on for correctness other than `permission_request`,
/// which yields the decision the Router must eventually act on.
#[async_trait]
pub trait OutputPort: Send + Sync {
    async fn session_start(&self, session_id: &str);
    async fn session_end(&self, session_id: &str);
    async fn name_update(&self, session_id: &str, name: &str);
    async fn status_change(&self, session_id: &str, status: tether_types::SessionStatus);
    async fn title_change(&self, session_id: &str, title: &str);
    async fn message(&self, session_id: &str, role: &str, text: &str);
    async fn todos(&self, session_id: &str, todos: &serde_json::Value);
    async fn tool_call(&self, session_id: &str, call: ToolCall);
    async fn tool_result(&self, session_id: &str, result: ToolResult);
    async fn plan_mode_change(&self, session_id: &str, active: bool);

    /// Returns the decision once the user (or a fallback policy)
    /// resolves it. No built-in timeout: the core never cancels this
    /// future on its own.
    async fn permission_request(&self, request: PermissionRequest) -> PermissionDecision;

    /// Specialization of `permission_request` for the ask-user tool.
    /// The adapter is expected to eventually call back into the Router
    /// with collected answers rather than resolve this directly; the
    /// default implementation reflects that by never resolving early.
    async fn structured_question(&self, question: StructuredQuestion);

    /// Current chat-thread binding for a session, if the adapter has one.
    async fn current_thread(&self, session_id: &str) -> Option<String>;

    /// Revive (un-archive) a previously archived thread after a
    /// persisted-mapping lookup succeeds.
    async fn revive_thread(&self, thread_id: &str) -> bool;

    /// Post a "session lost" notice and archive the thread, used by
    /// startup reconciliation.
    async fn notify_session_lost(&self, thread_id: &str);
}
