// HTTP adapter
// Plain request/response transport with manual event synthesis: one
// turn.started, one completed agent_message, one terminal event.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use ads_protocol::{
    AgentDescriptor, AgentStatus, ProgressEvent, StreamingConfig, ThreadEvent, ThreadItem, Usage,
};

use crate::adapter::{
    check_output_schema, AgentAdapter, AgentError, AgentInput, AgentReply, SendOptions,
    TurnEmitter,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub descriptor: AgentDescriptor,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub use_vertex: bool,
}

#[derive(Debug, Default)]
struct MutableState {
    cwd: Option<PathBuf>,
    model_override: Option<String>,
    thread_id: Option<String>,
    history: Vec<Value>,
    streaming: bool,
    last_error: Option<String>,
}

pub struct GeminiHttpAdapter {
    config: GeminiConfig,
    client: reqwest::Client,
    state: RwLock<MutableState>,
    events: broadcast::Sender<ProgressEvent>,
}

impl GeminiHttpAdapter {
    pub fn new(config: GeminiConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            client: reqwest::Client::new(),
            state: RwLock::new(MutableState::default()),
            events,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[async_trait]
impl AgentAdapter for GeminiHttpAdapter {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.config.descriptor
    }

    async fn status(&self) -> AgentStatus {
        if self.config.api_key.trim().is_empty() && !self.config.use_vertex {
            return AgentStatus::unready("missing GEMINI_API_KEY / GOOGLE_API_KEY");
        }
        let state = self.state.read().await;
        AgentStatus {
            ready: true,
            streaming: state.streaming,
            error: state.last_error.clone(),
        }
    }

    async fn send(
        &self,
        input: AgentInput,
        options: SendOptions,
    ) -> Result<AgentReply, AgentError> {
        let status = self.status().await;
        if !status.ready {
            return Err(AgentError::Config(
                status.error.unwrap_or_else(|| "agent not ready".to_string()),
            ));
        }

        let (prompt, _images) = input.flatten();
        let (model, thread_id, mut contents) = {
            let mut state = self.state.write().await;
            state.streaming = true;
            let model = state
                .model_override
                .clone()
                .unwrap_or_else(|| self.config.model.clone());
            let thread_id = state
                .thread_id
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            (model, thread_id, state.history.clone())
        };
        contents.push(json!({"role": "user", "parts": [{"text": prompt.clone()}]}));

        let mut emitter = TurnEmitter::new(self.events.clone(), options.streaming);
        emitter.emit(&ThreadEvent::ThreadStarted {
            thread_id: thread_id.clone(),
        });
        emitter.emit(&ThreadEvent::TurnStarted);

        let request = self
            .client
            .post(self.endpoint(&model))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&json!({"contents": contents}));

        let outcome = tokio::select! {
            _ = options.cancel.cancelled() => Err(AgentError::Cancelled),
            response = request.send() => match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        response
                            .json::<Value>()
                            .await
                            .map_err(|err| AgentError::Transport(err.to_string()))
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        let snippet: String = text.chars().take(400).collect();
                        Err(AgentError::Transport(format!(
                            "gemini request failed with status {status}: {snippet}"
                        )))
                    }
                }
                Err(err) => Err(AgentError::Transport(err.to_string())),
            },
        };

        let mut state = self.state.write().await;
        state.streaming = false;
        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                let message = match &err {
                    AgentError::Cancelled => "aborted".to_string(),
                    other => other.to_string(),
                };
                state.last_error = Some(message.clone());
                drop(state);
                emitter.fail_if_open(&message);
                return Err(err);
            }
        };

        let text = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            let message = "gemini response carried no candidates".to_string();
            state.last_error = Some(message.clone());
            drop(state);
            emitter.fail_if_open(&message);
            return Err(AgentError::Transport(message));
        }

        let usage = value.get("usageMetadata").map(|meta| Usage {
            input_tokens: meta
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: meta
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });

        state
            .history
            .push(json!({"role": "user", "parts": [{"text": prompt}]}));
        state
            .history
            .push(json!({"role": "model", "parts": [{"text": text.clone()}]}));
        state.last_error = None;
        drop(state);

        emitter.emit(&ThreadEvent::ItemCompleted {
            item: ThreadItem::AgentMessage {
                id: "msg".to_string(),
                text: text.clone(),
            },
        });
        emitter.complete_if_open(usage);

        if let Some(schema) = &options.output_schema {
            check_output_schema(&text, schema)?;
        }

        Ok(AgentReply {
            response: text,
            usage,
            agent_id: self.config.descriptor.id.clone(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    async fn reset(&self) {
        let mut state = self.state.write().await;
        state.thread_id = None;
        state.history.clear();
        state.last_error = None;
    }

    async fn set_working_directory(&self, cwd: PathBuf) {
        self.state.write().await.cwd = Some(cwd);
    }

    async fn set_model(&self, model: String) {
        self.state.write().await.model_override = Some(model);
    }

    async fn thread_id(&self) -> Option<String> {
        self.state.read().await.thread_id.clone()
    }

    fn streaming_config(&self) -> StreamingConfig {
        StreamingConfig {
            enabled: false,
            throttle_ms: 0,
        }
    }
}
