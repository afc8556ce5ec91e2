// Wire frames exchanged over the bridge socket.

use serde::{Deserialize, Serialize};

use ads_protocol::{AgentDescriptor, AgentStatus, ProgressEvent};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    Interrupt,
    ClearHistory,
    Prompt {
        text: String,
        #[serde(default)]
        agent: Option<String>,
    },
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    TaskResume {
        #[serde(default)]
        task_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session_id: String,
        chat_session_id: String,
    },
    Agents {
        agents: Vec<AgentInfo>,
    },
    Event {
        event: ProgressEvent,
    },
    Result {
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        ok: bool,
    },
    Error {
        message: String,
    },
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_frames_tag_their_type() {
        let frame = ServerFrame::Result {
            response: "done".to_string(),
            agent_id: Some("codex".to_string()),
            ok: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["agent_id"], "codex");
    }
}
