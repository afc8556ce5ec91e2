// Thread event vocabulary
// Every adapter, regardless of wire format, emits only these shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: TurnError },
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ThreadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThreadEvent::TurnCompleted { .. } | ThreadEvent::TurnFailed { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchChangeKind {
    Add,
    Delete,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdateChange {
    pub path: String,
    pub kind: PatchChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// Closed sum of item kinds. Vendor tool calls are classified into one of
/// these discriminants by the stream parser; the payload per kind is typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item_type", rename_all = "snake_case")]
pub enum ThreadItem {
    AgentMessage {
        id: String,
        text: String,
    },
    Reasoning {
        id: String,
        text: String,
    },
    CommandExecution {
        id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregated_output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        status: ItemStatus,
    },
    FileChange {
        id: String,
        #[serde(default)]
        changes: Vec<FileUpdateChange>,
        status: ItemStatus,
    },
    WebSearch {
        id: String,
        query: String,
    },
    McpToolCall {
        id: String,
        server: String,
        tool: String,
        status: ItemStatus,
    },
    TodoList {
        id: String,
        #[serde(default)]
        items: Vec<TodoItem>,
    },
    Error {
        id: String,
        message: String,
    },
}

impl ThreadItem {
    pub fn id(&self) -> &str {
        match self {
            ThreadItem::AgentMessage { id, .. }
            | ThreadItem::Reasoning { id, .. }
            | ThreadItem::CommandExecution { id, .. }
            | ThreadItem::FileChange { id, .. }
            | ThreadItem::WebSearch { id, .. }
            | ThreadItem::McpToolCall { id, .. }
            | ThreadItem::TodoList { id, .. }
            | ThreadItem::Error { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ThreadItem::AgentMessage { .. } => "agent_message",
            ThreadItem::Reasoning { .. } => "reasoning",
            ThreadItem::CommandExecution { .. } => "command_execution",
            ThreadItem::FileChange { .. } => "file_change",
            ThreadItem::WebSearch { .. } => "web_search",
            ThreadItem::McpToolCall { .. } => "mcp_tool_call",
            ThreadItem::TodoList { .. } => "todo_list",
            ThreadItem::Error { .. } => "error",
        }
    }
}

/// Result of decoding one raw wire line that claims to already carry the
/// canonical vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Event(ThreadEvent),
    /// Raw type not part of the vocabulary; dropped silently.
    Unknown,
    /// Recognised type with a malformed body; the caller may surface a
    /// synthetic error event instead.
    Malformed(String),
}

const KNOWN_TYPES: [&str; 8] = [
    "thread.started",
    "turn.started",
    "turn.completed",
    "turn.failed",
    "item.started",
    "item.updated",
    "item.completed",
    "error",
];

/// Explicit decoder: returns a typed event, `Unknown` for foreign raw types,
/// or `Malformed` for events that name a known type but fail validation
/// (missing `thread_id` on `thread.started`, missing `item_type` on items).
pub fn decode_line(raw: &Value) -> DecodeOutcome {
    let Some(kind) = raw.get("type").and_then(Value::as_str) else {
        return DecodeOutcome::Unknown;
    };
    if !KNOWN_TYPES.contains(&kind) {
        return DecodeOutcome::Unknown;
    }
    match kind {
        "thread.started" => {
            if raw.get("thread_id").and_then(Value::as_str).is_none() {
                return DecodeOutcome::Malformed("thread.started without thread_id".to_string());
            }
        }
        "item.started" | "item.updated" | "item.completed" => {
            let has_kind = raw
                .get("item")
                .and_then(|item| item.get("item_type"))
                .and_then(Value::as_str)
                .is_some();
            if !has_kind {
                return DecodeOutcome::Malformed(format!("{kind} without item type"));
            }
        }
        _ => {}
    }
    match serde_json::from_value::<ThreadEvent>(raw.clone()) {
        Ok(event) => DecodeOutcome::Event(event),
        Err(err) => DecodeOutcome::Malformed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_thread_started() {
        let raw = json!({"type": "thread.started", "thread_id": "t-1"});
        assert_eq!(
            decode_line(&raw),
            DecodeOutcome::Event(ThreadEvent::ThreadStarted {
                thread_id: "t-1".to_string()
            })
        );
    }

    #[test]
    fn decode_rejects_missing_thread_id() {
        let raw = json!({"type": "thread.started"});
        assert!(matches!(decode_line(&raw), DecodeOutcome::Malformed(_)));
    }

    #[test]
    fn decode_drops_unknown_types() {
        let raw = json!({"type": "vendor.telemetry", "blob": 1});
        assert_eq!(decode_line(&raw), DecodeOutcome::Unknown);
    }

    #[test]
    fn decode_rejects_item_without_kind() {
        let raw = json!({"type": "item.started", "item": {"id": "i-1"}});
        assert!(matches!(decode_line(&raw), DecodeOutcome::Malformed(_)));
    }

    #[test]
    fn item_round_trips_through_tagged_json() {
        let item = ThreadItem::CommandExecution {
            id: "i-2".to_string(),
            command: "cargo check".to_string(),
            aggregated_output: None,
            exit_code: Some(0),
            status: ItemStatus::Completed,
        };
        let raw = serde_json::to_value(ThreadEvent::ItemCompleted { item: item.clone() }).unwrap();
        assert_eq!(raw["item"]["item_type"], "command_execution");
        assert_eq!(
            decode_line(&raw),
            DecodeOutcome::Event(ThreadEvent::ItemCompleted { item })
        );
    }
}
