//! Pending-permission and pending-structured-question bookkeeping: a
//! resolver-channel map for plain permission requests, and a
//! `PendingQuestionAggregator` whose own methods enforce the rule that
//! a composite ask-user request only completes once every question in
//! it has an answer.

use std::collections::HashMap;
use tether_types::PermissionDecision;
use tokio::sync::oneshot;

/// One outstanding plain permission request. Resolved exactly once,
/// either by a user decision, a YOLO short-circuit, or a fallback
/// policy; dropped without resolving on session end.
pub struct PendingPermissions {
    resolvers: HashMap<String, oneshot::Sender<PermissionDecision>>,
}

impl PendingPermissions {
    pub fn new() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    /// Registers a new pending request, returning the receiver the
    /// caller awaits for the eventual decision.
    pub fn register(&mut self, request_id: String) -> oneshot::Receiver<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        self.resolvers.insert(request_id, tx);
        rx
    }

    /// Resolves a pending request. Returns `false` if the request id
    /// is unknown or was already resolved, per "a decision may arrive
    /// only once per request id; subsequent attempts are ignored".
    pub fn resolve(&mut self, request_id: &str, decision: PermissionDecision) -> bool {
        match self.resolvers.remove(request_id) {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Drops a single pending request without resolving it, used once
    /// a race with an adapter-returned future has already produced a
    /// decision through another path.
    pub fn cancel(&mut self, request_id: &str) {
        self.resolvers.remove(request_id);
    }

    /// Drops all pending requests for a session without resolving
    /// them, per "explicit session end cancels all pending requests".
    pub fn cancel_all_for(&mut self, ids: &[String]) {
        for id in ids {
            self.resolvers.remove(id);
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.resolvers.contains_key(request_id)
    }
}

impl Default for PendingPermissions {
    fn default() -> Self {
        Self::new()
    }
}

/// One outstanding composite "ask-user" request: the full question
/// list plus per-question captured answers. Exposes only
/// `record_answer`/`try_finalize` so the composite key (tool-use id
/// plus question index) stays an internal detail.
pub struct PendingQuestionAggregator {
    pub session_id: String,
    total_questions: usize,
    answers: HashMap<usize, serde_json::Value>,
}

impl PendingQuestionAggregator {
    pub fn new(session_id: String, total_questions: usize) -> Self {
        Self {
            session_id,
            total_questions,
            answers: HashMap::new(),
        }
    }

    /// Records (or overwrites) the answer for one question index.
    pub fn record_answer(&mut self, index: usize, answer: serde_json::Value) {
        self.answers.insert(index, answer);
    }

    /// Returns the completed answer set keyed by stringified index
    /// once every question has an answer; otherwise `None` and the
    /// aggregator remains pending.
    pub fn try_finalize(&self) -> Option<serde_json::Value> {
        if self.answers.len() < self.total_questions {
            return None;
        }
        let mut map = serde_json::Map::new();
        for idx in 0..self.total_questions {
            let answer = self.answers.get(&idx)?;
            map.insert(idx.to_string(), answer.clone());
        }
        Some(serde_json::Value::Object(map))
    }
}
