//! RPC frame schema exchanged between the daemon's RPC Hub and runner
//! agents over the local named channel. One JSON object per line.

use serde::{Deserialize, Serialize};

/// A permission decision as delivered back to the runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// The body of a `permission_response` frame.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PermissionDecision {
    pub behavior: Option<PermissionBehavior>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            behavior: Some(PermissionBehavior::Allow),
            message: None,
            updated_input: None,
        }
    }

    pub fn allow_with_answers(answers: serde_json::Value) -> Self {
        Self {
            behavior: Some(PermissionBehavior::Allow),
            message: None,
            updated_input: Some(serde_json::json!({ "answers": answers })),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: Some(PermissionBehavior::Deny),
            message: Some(message.into()),
            updated_input: None,
        }
    }
}

/// Frames sent by a runner (or permission-hook) to the Hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SessionStart {
        id: String,
        #[serde(rename = "projectDir")]
        project_dir: String,
        cwd: String,
        command: Vec<String>,
        name: String,
        #[serde(rename = "jsonlFile")]
        jsonl_file: String,
        pid: u32,
    },
    SessionEnd {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    TitleUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        title: String,
    },
    PtyOutput {
        #[serde(rename = "sessionId")]
        session_id: String,
        content: String,
        #[serde(default)]
        is_thinking: bool,
        timestamp: Option<String>,
    },
    PermissionRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },
    PermissionResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        decision: PermissionDecision,
    },
}

/// Frames sent by the Hub to a runner: reverse-direction input
/// delivery, and the resolved decision for a `permission_request` the
/// runner (or a permission-hook) raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Input {
        text: String,
    },
    PermissionResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        decision: PermissionDecision,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_start_round_trips_through_json() {
        let line = r#"{"type":"session_start","id":"A","projectDir":"/p","cwd":"/w","command":["claude"],"name":"claude","jsonlFile":"A.jsonl","pid":4242}"#;
        let frame: ClientFrame = serde_json::from_str(line).unwrap();
        match frame {
            ClientFrame::SessionStart { id, pid, .. } => {
                assert_eq!(id, "A");
                assert_eq!(pid, 4242);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn input_frame_serializes_with_carriage_return() {
        let f = ServerFrame::Input {
            text: "\r".to_string(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"{"type":"input","text":"\r"}"#);
    }

    #[test]
    fn allow_with_answers_shapes_updated_input() {
        let d = PermissionDecision::allow_with_answers(serde_json::json!({"0": "yes", "1": "no"}));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["updatedInput"]["answers"]["0"], "yes");
    }
}
