// Stream parser
// Translates the vendor stream-JSON wire format (system/init, assistant
// content blocks, tool results, result) into the canonical thread events.
// Stateful per turn: accumulated assistant text, accumulated reasoning, and
// a tool_use_id map that pairs starts with completions across lines.

use std::collections::HashMap;

use serde_json::Value;

use ads_protocol::thread::{FileUpdateChange, PatchChangeKind, TodoItem};
use ads_protocol::{ItemStatus, ThreadEvent, ThreadItem, TurnError, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    Command,
    FileChange,
    WebSearch,
    McpToolCall,
}

#[derive(Debug, Clone)]
struct PendingTool {
    name: String,
    kind: ToolKind,
    change_kind: Option<PatchChangeKind>,
    input: Value,
}

/// Classification is deterministic from the tool name; unknown names are
/// treated as MCP tool calls.
fn classify_tool(name: &str) -> (ToolKind, Option<PatchChangeKind>) {
    match name.trim().to_ascii_lowercase().as_str() {
        "bash" | "shell" | "run_command" | "exec" => (ToolKind::Command, None),
        "write" | "create" | "notebookedit" => (ToolKind::FileChange, Some(PatchChangeKind::Add)),
        "edit" | "multiedit" | "apply_patch" | "str_replace_editor" => {
            (ToolKind::FileChange, Some(PatchChangeKind::Update))
        }
        "websearch" | "web_search" | "webfetch" | "web_fetch" => (ToolKind::WebSearch, None),
        _ => (ToolKind::McpToolCall, None),
    }
}

#[derive(Default)]
pub struct StreamParser {
    agent_message: String,
    reasoning: String,
    tools: HashMap<String, PendingTool>,
    session_id: Option<String>,
    last_error: Option<String>,
    turn_started: bool,
    usage: Option<Usage>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn final_message(&self) -> &str {
        &self.agent_message
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Feed one raw vendor line; returns the canonical events it maps to.
    pub fn push_line(&mut self, raw: &Value) -> Vec<ThreadEvent> {
        let Some(kind) = raw.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };
        match kind {
            "system" => self.on_system(raw),
            "assistant" => self.on_assistant(raw),
            "user" => self.on_user(raw),
            "result" => self.on_result(raw),
            "error" => self.on_error(raw),
            _ => Vec::new(),
        }
    }

    fn on_system(&mut self, raw: &Value) -> Vec<ThreadEvent> {
        if raw.get("subtype").and_then(Value::as_str) != Some("init") {
            return Vec::new();
        }
        let Some(session_id) = raw.get("session_id").and_then(Value::as_str) else {
            return Vec::new();
        };
        self.session_id = Some(session_id.to_string());
        let mut events = vec![ThreadEvent::ThreadStarted {
            thread_id: session_id.to_string(),
        }];
        if !self.turn_started {
            self.turn_started = true;
            events.push(ThreadEvent::TurnStarted);
        }
        events
    }

    fn on_assistant(&mut self, raw: &Value) -> Vec<ThreadEvent> {
        let blocks = raw
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut events = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        self.agent_message.push_str(text);
                        events.push(ThreadEvent::ItemUpdated {
                            item: ThreadItem::AgentMessage {
                                id: "msg".to_string(),
                                text: self.agent_message.clone(),
                            },
                        });
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        self.reasoning.push_str(text);
                        events.push(ThreadEvent::ItemUpdated {
                            item: ThreadItem::Reasoning {
                                id: "reasoning".to_string(),
                                text: self.reasoning.clone(),
                            },
                        });
                    }
                }
                Some("tool_use") => {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if id.is_empty() {
                        continue;
                    }
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let (kind, change_kind) = classify_tool(&name);
                    let pending = PendingTool {
                        name,
                        kind,
                        change_kind,
                        input,
                    };
                    events.push(ThreadEvent::ItemStarted {
                        item: self.item_for(&id, &pending, ItemStatus::InProgress, None),
                    });
                    self.tools.insert(id, pending);
                }
                _ => {}
            }
        }
        events
    }

    fn on_user(&mut self, raw: &Value) -> Vec<ThreadEvent> {
        let blocks = raw
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut events = Vec::new();
        for block in &blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(pending) = self.tools.remove(id) else {
                continue;
            };
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let status = if is_error {
                ItemStatus::Failed
            } else {
                ItemStatus::Completed
            };
            let exit_code = Some(if is_error { 1 } else { 0 });
            events.push(ThreadEvent::ItemCompleted {
                item: self.item_for(id, &pending, status, exit_code),
            });
            if is_error && pending.kind == ToolKind::FileChange {
                let message = tool_result_text(block)
                    .unwrap_or_else(|| format!("{} failed", pending.name));
                events.push(ThreadEvent::Error { message });
            }
        }
        events
    }

    fn on_result(&mut self, raw: &Value) -> Vec<ThreadEvent> {
        self.usage = raw
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok());
        if raw.get("subtype").and_then(Value::as_str) == Some("success") {
            if let Some(result) = raw.get("result").and_then(Value::as_str) {
                if !result.is_empty() {
                    self.agent_message = result.to_string();
                }
            }
            let mut events = Vec::new();
            if !self.agent_message.is_empty() {
                events.push(ThreadEvent::ItemCompleted {
                    item: ThreadItem::AgentMessage {
                        id: "msg".to_string(),
                        text: self.agent_message.clone(),
                    },
                });
            }
            events.push(ThreadEvent::TurnCompleted { usage: self.usage });
            return events;
        }
        let message = raw
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.last_error.clone())
            .or_else(|| {
                raw.get("subtype")
                    .and_then(Value::as_str)
                    .map(|s| format!("turn ended with {s}"))
            })
            .unwrap_or_else(|| "turn failed".to_string());
        vec![ThreadEvent::TurnFailed {
            error: TurnError { message },
        }]
    }

    fn on_error(&mut self, raw: &Value) -> Vec<ThreadEvent> {
        let message = raw
            .pointer("/error/message")
            .or_else(|| raw.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("agent error")
            .to_string();
        self.last_error = Some(message.clone());
        vec![ThreadEvent::Error { message }]
    }

    fn item_for(
        &self,
        id: &str,
        pending: &PendingTool,
        status: ItemStatus,
        exit_code: Option<i32>,
    ) -> ThreadItem {
        match pending.kind {
            ToolKind::Command => ThreadItem::CommandExecution {
                id: id.to_string(),
                command: pending
                    .input
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or(&pending.name)
                    .to_string(),
                aggregated_output: None,
                exit_code,
                status,
            },
            ToolKind::FileChange => {
                let path = pending
                    .input
                    .get("file_path")
                    .or_else(|| pending.input.get("path"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let changes = if path.is_empty() {
                    Vec::new()
                } else {
                    vec![FileUpdateChange {
                        path: path.to_string(),
                        kind: pending.change_kind.unwrap_or(PatchChangeKind::Update),
                    }]
                };
                ThreadItem::FileChange {
                    id: id.to_string(),
                    changes,
                    status,
                }
            }
            ToolKind::WebSearch => ThreadItem::WebSearch {
                id: id.to_string(),
                query: pending
                    .input
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            ToolKind::McpToolCall => {
                let (server, tool) = split_mcp_name(&pending.name);
                if tool == "todowrite" || tool == "todo_write" {
                    ThreadItem::TodoList {
                        id: id.to_string(),
                        items: todo_items(&pending.input),
                    }
                } else {
                    ThreadItem::McpToolCall {
                        id: id.to_string(),
                        server,
                        tool,
                        status,
                    }
                }
            }
        }
    }
}

fn split_mcp_name(name: &str) -> (String, String) {
    let lowered = name.to_ascii_lowercase();
    let mut parts = lowered.splitn(3, "__");
    match (parts.next(), parts.next(), parts.next()) {
        (Some("mcp"), Some(server), Some(tool)) => (server.to_string(), tool.to_string()),
        _ => ("host".to_string(), lowered),
    }
}

fn todo_items(input: &Value) -> Vec<TodoItem> {
    input
        .get("todos")
        .and_then(Value::as_array)
        .map(|todos| {
            todos
                .iter()
                .filter_map(|todo| {
                    let text = todo.get("content").and_then(Value::as_str)?;
                    let completed =
                        todo.get("status").and_then(Value::as_str) == Some("completed");
                    Some(TodoItem {
                        text: text.to_string(),
                        completed,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn tool_result_text(block: &Value) -> Option<String> {
    match block.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(parts)) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_text(text: &str) -> Value {
        json!({"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}})
    }

    #[test]
    fn init_starts_thread_and_turn_once() {
        let mut parser = StreamParser::new();
        let init = json!({"type": "system", "subtype": "init", "session_id": "s-1"});
        let events = parser.push_line(&init);
        assert_eq!(
            events[0],
            ThreadEvent::ThreadStarted {
                thread_id: "s-1".to_string()
            }
        );
        assert_eq!(events[1], ThreadEvent::TurnStarted);
        // A second init re-announces the thread but not the turn.
        let events = parser.push_line(&init);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn text_deltas_accumulate_and_finalize() {
        let mut parser = StreamParser::new();
        parser.push_line(&json!({"type": "system", "subtype": "init", "session_id": "s-1"}));
        for chunk in ["one ", "two ", "three"] {
            parser.push_line(&assistant_text(chunk));
        }
        let events = parser.push_line(&json!({"type": "result", "subtype": "success"}));
        assert_eq!(parser.final_message(), "one two three");
        assert!(matches!(
            events.last(),
            Some(ThreadEvent::TurnCompleted { .. })
        ));
        match &events[0] {
            ThreadEvent::ItemCompleted {
                item: ThreadItem::AgentMessage { text, .. },
            } => assert_eq!(text, "one two three"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_use_pairs_with_result_across_lines() {
        let mut parser = StreamParser::new();
        let start = json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "tu-1", "name": "Bash",
             "input": {"command": "cargo test"}}
        ]}});
        let events = parser.push_line(&start);
        assert!(matches!(
            &events[0],
            ThreadEvent::ItemStarted {
                item: ThreadItem::CommandExecution { command, .. }
            } if command == "cargo test"
        ));

        let done = json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "tu-1", "content": "ok", "is_error": false}
        ]}});
        let events = parser.push_line(&done);
        assert!(matches!(
            &events[0],
            ThreadEvent::ItemCompleted {
                item: ThreadItem::CommandExecution {
                    exit_code: Some(0),
                    status: ItemStatus::Completed,
                    ..
                }
            }
        ));
    }

    #[test]
    fn failed_file_change_also_emits_error() {
        let mut parser = StreamParser::new();
        parser.push_line(&json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "tu-2", "name": "Edit",
             "input": {"file_path": "src/lib.rs"}}
        ]}}));
        let events = parser.push_line(&json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "tu-2",
             "content": "file not found", "is_error": true}
        ]}}));
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            ThreadEvent::Error { message } if message == "file not found"
        ));
    }

    #[test]
    fn non_success_result_fails_turn() {
        let mut parser = StreamParser::new();
        parser.push_line(&json!({"type": "error", "message": "rate limited"}));
        let events =
            parser.push_line(&json!({"type": "result", "subtype": "error_during_execution"}));
        assert!(matches!(
            &events[0],
            ThreadEvent::TurnFailed { error } if error.message == "rate limited"
        ));
    }

    #[test]
    fn reasoning_accumulates_separately() {
        let mut parser = StreamParser::new();
        parser.push_line(&json!({"type": "assistant", "message": {"content": [
            {"type": "thinking", "thinking": "hmm "}
        ]}}));
        let events = parser.push_line(&json!({"type": "assistant", "message": {"content": [
            {"type": "thinking", "thinking": "okay"}
        ]}}));
        assert!(matches!(
            &events[0],
            ThreadEvent::ItemUpdated {
                item: ThreadItem::Reasoning { text, .. }
            } if text == "hmm okay"
        ));
        assert!(parser.final_message().is_empty());
    }

    #[test]
    fn unknown_line_types_are_dropped() {
        let mut parser = StreamParser::new();
        assert!(parser
            .push_line(&json!({"type": "vendor_debug", "x": 1}))
            .is_empty());
    }
}
