//! The subset of the agent's append-only event-log record shape the
//! Tailer consumes. Unknown fields are ignored by serde's default
//! struct behavior; records that fail to deserialize are a per-line
//! parse error handled by the caller, not by this module.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub todos: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "isMeta")]
    pub is_meta: bool,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventMessage {
    pub role: String,
    pub content: MessageContent,
}

/// `message.content` is either a bare string or a list of typed items.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    /// Any content item type this module doesn't need to act on.
    #[serde(other)]
    Unknown,
}

/// `tool_result.content` may be a bare string or a list of text parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ContentItem>),
}

impl ToolResultContent {
    /// Joins all text parts, matching the Tailer's "joining text parts" rule.
    pub fn joined_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Parts(items) => items
                .iter()
                .filter_map(|item| match item {
                    ContentItem::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl MessageContent {
    /// Concatenates all plain-text content, used for the first-seen
    /// message dedup check.
    pub fn as_plain_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Items(items) => items
                .iter()
                .filter_map(|item| match item {
                    ContentItem::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_message() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let rec: EventRecord = serde_json::from_str(line).unwrap();
        let msg = rec.message.unwrap();
        assert_eq!(msg.content.as_plain_text(), "hi");
    }

    #[test]
    fn parses_tool_use_item() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let rec: EventRecord = serde_json::from_str(line).unwrap();
        let msg = rec.message.unwrap();
        match msg.content {
            MessageContent::Items(items) => match &items[0] {
                ContentItem::ToolUse { id, name, .. } => {
                    assert_eq!(id, "t1");
                    assert_eq!(name, "Bash");
                }
                other => panic!("unexpected item: {other:?}"),
            },
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn unknown_content_item_does_not_fail_parse() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"..."}]}}"#;
        let rec: EventRecord = serde_json::from_str(line).unwrap();
        assert!(rec.message.is_some());
    }
}
