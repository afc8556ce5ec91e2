// Progress events
// The canonical per-turn record broadcast to orchestrator listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::thread::{ItemStatus, ThreadEvent, ThreadItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Boot,
    Analysis,
    Context,
    Editing,
    Tool,
    Command,
    Responding,
    Completed,
    Connection,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: EventPhase,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub raw: Value,
}

impl ProgressEvent {
    pub fn new(phase: EventPhase, title: impl Into<String>) -> Self {
        Self {
            phase,
            title: title.into(),
            detail: None,
            delta: None,
            timestamp: Utc::now(),
            raw: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_delta(mut self, delta: impl Into<String>) -> Self {
        self.delta = Some(delta.into());
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Deterministic mapping from an item discriminant to the phase its
/// lifecycle events are reported under.
pub fn phase_for_item(item: &ThreadItem) -> EventPhase {
    match item {
        ThreadItem::AgentMessage { .. } => EventPhase::Responding,
        ThreadItem::Reasoning { .. } => EventPhase::Analysis,
        ThreadItem::CommandExecution { .. } => EventPhase::Command,
        ThreadItem::FileChange { .. } => EventPhase::Editing,
        ThreadItem::WebSearch { .. } | ThreadItem::McpToolCall { .. } => EventPhase::Tool,
        ThreadItem::TodoList { .. } => EventPhase::Context,
        ThreadItem::Error { .. } => EventPhase::Error,
    }
}

fn item_title(item: &ThreadItem) -> String {
    match item {
        ThreadItem::AgentMessage { .. } => "assistant".to_string(),
        ThreadItem::Reasoning { .. } => "thinking".to_string(),
        ThreadItem::CommandExecution { command, .. } => command.clone(),
        ThreadItem::FileChange { changes, .. } => changes
            .first()
            .map(|c| c.path.clone())
            .unwrap_or_else(|| "file change".to_string()),
        ThreadItem::WebSearch { query, .. } => query.clone(),
        ThreadItem::McpToolCall { server, tool, .. } => format!("{server}.{tool}"),
        ThreadItem::TodoList { .. } => "todo list".to_string(),
        ThreadItem::Error { message, .. } => message.clone(),
    }
}

/// Translate a canonical thread event into the progress record broadcast to
/// listeners. Returns `None` for events with no user-facing counterpart.
pub fn progress_for(event: &ThreadEvent) -> Option<ProgressEvent> {
    let raw = serde_json::to_value(event).unwrap_or(Value::Null);
    let progress = match event {
        ThreadEvent::ThreadStarted { thread_id } => {
            ProgressEvent::new(EventPhase::Connection, "thread started")
                .with_detail(thread_id.clone())
        }
        ThreadEvent::TurnStarted => ProgressEvent::new(EventPhase::Boot, "turn started"),
        ThreadEvent::TurnCompleted { .. } => {
            ProgressEvent::new(EventPhase::Completed, "turn completed")
        }
        ThreadEvent::TurnFailed { error } => {
            ProgressEvent::new(EventPhase::Error, "turn failed").with_detail(error.message.clone())
        }
        ThreadEvent::ItemStarted { item } => {
            ProgressEvent::new(phase_for_item(item), item_title(item))
        }
        ThreadEvent::ItemUpdated { item } => {
            let mut progress = ProgressEvent::new(phase_for_item(item), item_title(item));
            if let ThreadItem::AgentMessage { text, .. } | ThreadItem::Reasoning { text, .. } = item
            {
                progress = progress.with_delta(text.clone());
            }
            progress
        }
        ThreadEvent::ItemCompleted { item } => {
            let mut progress = ProgressEvent::new(phase_for_item(item), item_title(item));
            if let ThreadItem::CommandExecution {
                exit_code: Some(code),
                status,
                ..
            } = item
            {
                let outcome = match status {
                    ItemStatus::Failed => "failed",
                    _ => "ok",
                };
                progress = progress.with_detail(format!("exit {code} ({outcome})"));
            }
            progress
        }
        ThreadEvent::Error { message } => {
            ProgressEvent::new(EventPhase::Error, "error").with_detail(message.clone())
        }
    };
    Some(progress.with_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_follow_item_kind() {
        let item = ThreadItem::FileChange {
            id: "i-1".to_string(),
            changes: vec![],
            status: ItemStatus::InProgress,
        };
        assert_eq!(phase_for_item(&item), EventPhase::Editing);
    }

    #[test]
    fn agent_message_updates_carry_deltas() {
        let event = ThreadEvent::ItemUpdated {
            item: ThreadItem::AgentMessage {
                id: "i-1".to_string(),
                text: "hello".to_string(),
            },
        };
        let progress = progress_for(&event).unwrap();
        assert_eq!(progress.phase, EventPhase::Responding);
        assert_eq!(progress.delta.as_deref(), Some("hello"));
    }

    #[test]
    fn terminal_events_map_to_completed_and_error() {
        let done = progress_for(&ThreadEvent::TurnCompleted { usage: None }).unwrap();
        assert_eq!(done.phase, EventPhase::Completed);
        let failed = progress_for(&ThreadEvent::TurnFailed {
            error: crate::thread::TurnError {
                message: "aborted".to_string(),
            },
        })
        .unwrap();
        assert_eq!(failed.phase, EventPhase::Error);
        assert_eq!(failed.detail.as_deref(), Some("aborted"));
    }
}
