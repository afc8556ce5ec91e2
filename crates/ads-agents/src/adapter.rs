// Agent adapter contract
// One uniform capability surface over heterogeneous transports.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use ads_protocol::{
    progress_for, AgentDescriptor, AgentStatus, ProgressEvent, StreamingConfig, ThreadEvent,
    TurnError, Usage,
};

#[derive(Debug, Clone)]
pub enum InputPart {
    Text { text: String },
    LocalImage { path: PathBuf },
    LocalFile { path: PathBuf },
}

#[derive(Debug, Clone)]
pub enum AgentInput {
    Text(String),
    Parts(Vec<InputPart>),
}

impl AgentInput {
    /// Flatten into the prompt text plus attachment paths.
    pub fn flatten(&self) -> (String, Vec<PathBuf>) {
        match self {
            AgentInput::Text(text) => (text.clone(), Vec::new()),
            AgentInput::Parts(parts) => {
                let mut prompt = String::new();
                let mut images = Vec::new();
                for part in parts {
                    match part {
                        InputPart::Text { text } => {
                            if !prompt.is_empty() {
                                prompt.push('\n');
                            }
                            prompt.push_str(text);
                        }
                        InputPart::LocalImage { path } => images.push(path.clone()),
                        InputPart::LocalFile { path } => {
                            if !prompt.is_empty() {
                                prompt.push('\n');
                            }
                            prompt.push_str(&format!("@{}", path.display()));
                        }
                    }
                }
                (prompt, images)
            }
        }
    }
}

impl From<&str> for AgentInput {
    fn from(text: &str) -> Self {
        AgentInput::Text(text.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub streaming: bool,
    pub cancel: CancellationToken,
    pub output_schema: Option<Value>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            cancel: CancellationToken::new(),
            output_schema: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub response: String,
    pub usage: Option<Usage>,
    pub agent_id: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not invocable: {0}")]
    Config(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid structured output: {0}")]
    Schema(String),
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    async fn status(&self) -> AgentStatus;

    async fn send(&self, input: AgentInput, options: SendOptions)
        -> Result<AgentReply, AgentError>;

    /// Subscribe to progress events; dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<ProgressEvent>;

    /// Forget the current thread so the next send starts a fresh one.
    async fn reset(&self);

    /// Seed a persisted thread id so the next send resumes it. Transports
    /// without resumable threads ignore this.
    async fn resume_thread(&self, _thread_id: String) {}

    async fn set_working_directory(&self, cwd: PathBuf);

    async fn set_model(&self, model: String);

    async fn thread_id(&self) -> Option<String>;

    fn streaming_config(&self) -> StreamingConfig;
}

/// Shared per-send event emission. Guarantees the invariant that every send
/// publishes exactly one terminal event, and suppresses intermediate item
/// updates when the caller asked for a non-streaming send.
pub struct TurnEmitter {
    tx: broadcast::Sender<ProgressEvent>,
    streaming: bool,
    terminal_emitted: bool,
}

impl TurnEmitter {
    pub fn new(tx: broadcast::Sender<ProgressEvent>, streaming: bool) -> Self {
        Self {
            tx,
            streaming,
            terminal_emitted: false,
        }
    }

    pub fn terminal_emitted(&self) -> bool {
        self.terminal_emitted
    }

    pub fn emit(&mut self, event: &ThreadEvent) {
        if self.terminal_emitted {
            return;
        }
        if !self.streaming && matches!(event, ThreadEvent::ItemUpdated { .. }) {
            return;
        }
        if event.is_terminal() {
            self.terminal_emitted = true;
        }
        if let Some(progress) = progress_for(event) {
            let _ = self.tx.send(progress);
        }
    }

    /// Close the turn with a failure if no terminal event was seen.
    pub fn fail_if_open(&mut self, message: &str) {
        if self.terminal_emitted {
            return;
        }
        self.emit(&ThreadEvent::TurnFailed {
            error: TurnError {
                message: message.to_string(),
            },
        });
    }

    /// Close the turn with completion if no terminal event was seen.
    pub fn complete_if_open(&mut self, usage: Option<Usage>) {
        if self.terminal_emitted {
            return;
        }
        self.emit(&ThreadEvent::TurnCompleted { usage });
    }
}

/// Validate a reply against a requested output schema: the response must be
/// a JSON object carrying every property the schema marks as required.
pub fn check_output_schema(response: &str, schema: &Value) -> Result<(), AgentError> {
    let payload = ads_protocol::extract_json_payload(response)
        .ok_or_else(|| AgentError::Schema("response is not JSON".to_string()))?;
    let value: Value = serde_json::from_str(&payload)
        .map_err(|err| AgentError::Schema(format!("response is not valid JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| AgentError::Schema("response is not a JSON object".to_string()))?;
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(AgentError::Schema(format!("missing required field `{key}`")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ads_protocol::EventPhase;

    #[test]
    fn flatten_joins_text_and_collects_images() {
        let input = AgentInput::Parts(vec![
            InputPart::Text {
                text: "look at".to_string(),
            },
            InputPart::LocalImage {
                path: PathBuf::from("/tmp/shot.png"),
            },
            InputPart::LocalFile {
                path: PathBuf::from("/tmp/notes.md"),
            },
        ]);
        let (prompt, images) = input.flatten();
        assert_eq!(prompt, "look at\n@/tmp/notes.md");
        assert_eq!(images, vec![PathBuf::from("/tmp/shot.png")]);
    }

    #[test]
    fn emitter_allows_exactly_one_terminal() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut emitter = TurnEmitter::new(tx, true);
        emitter.emit(&ThreadEvent::TurnStarted);
        emitter.emit(&ThreadEvent::TurnCompleted { usage: None });
        emitter.fail_if_open("late failure");
        emitter.complete_if_open(None);

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert_eq!(phases, vec![EventPhase::Boot, EventPhase::Completed]);
    }

    #[test]
    fn emitter_suppresses_deltas_when_not_streaming() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut emitter = TurnEmitter::new(tx, false);
        emitter.emit(&ThreadEvent::ItemUpdated {
            item: ads_protocol::ThreadItem::AgentMessage {
                id: "msg".to_string(),
                text: "partial".to_string(),
            },
        });
        emitter.complete_if_open(None);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.phase, EventPhase::Completed);
    }

    #[test]
    fn schema_check_requires_fields() {
        let schema = serde_json::json!({"required": ["summary"]});
        assert!(check_output_schema("{\"summary\":\"ok\"}", &schema).is_ok());
        assert!(matches!(
            check_output_schema("{\"other\":1}", &schema),
            Err(AgentError::Schema(_))
        ));
        assert!(matches!(
            check_output_schema("no json here", &schema),
            Err(AgentError::Schema(_))
        ));
    }
}
