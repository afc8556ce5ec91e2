// SDK-stream adapter
// Drives the Anthropic Messages API as a server-sent event stream and maps
// the vendor events onto the canonical vocabulary. Text deltas are throttled
// before they reach listeners; a vendor abort becomes the canonical
// cancelled error.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
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

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub descriptor: AgentDescriptor,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub streaming: StreamingConfig,
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

pub struct ClaudeSdkAdapter {
    config: ClaudeConfig,
    client: reqwest::Client,
    state: RwLock<MutableState>,
    events: broadcast::Sender<ProgressEvent>,
}

impl ClaudeSdkAdapter {
    pub fn new(config: ClaudeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            client: reqwest::Client::new(),
            state: RwLock::new(MutableState::default()),
            events,
        }
    }

    fn request_body(&self, model: &str, messages: &[Value], stream: bool) -> Value {
        json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, AgentError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(400).collect();
            return Err(AgentError::Transport(format!(
                "anthropic request failed with status {status}: {snippet}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl AgentAdapter for ClaudeSdkAdapter {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.config.descriptor
    }

    async fn status(&self) -> AgentStatus {
        if self.config.api_key.trim().is_empty() {
            return AgentStatus::unready("missing CLAUDE_API_KEY / ANTHROPIC_API_KEY");
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
        let (model, thread_id, mut messages) = {
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
        messages.push(json!({"role": "user", "content": prompt.clone()}));

        let mut emitter = TurnEmitter::new(self.events.clone(), options.streaming);
        emitter.emit(&ThreadEvent::ThreadStarted {
            thread_id: thread_id.clone(),
        });
        emitter.emit(&ThreadEvent::TurnStarted);

        let result = if options.streaming {
            self.send_streaming(&model, &messages, &options, &mut emitter)
                .await
        } else {
            self.send_buffered(&model, &messages, &options, &mut emitter)
                .await
        };

        let mut state = self.state.write().await;
        state.streaming = false;
        match result {
            Ok((text, usage)) => {
                state.history.push(json!({"role": "user", "content": prompt}));
                state
                    .history
                    .push(json!({"role": "assistant", "content": text.clone()}));
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
            Err(err) => {
                let message = match &err {
                    AgentError::Cancelled => "aborted".to_string(),
                    other => other.to_string(),
                };
                state.last_error = Some(message.clone());
                drop(state);
                emitter.fail_if_open(&message);
                Err(err)
            }
        }
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

    async fn resume_thread(&self, thread_id: String) {
        self.state.write().await.thread_id = Some(thread_id);
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
        self.config.streaming
    }
}

impl ClaudeSdkAdapter {
    async fn send_streaming(
        &self,
        model: &str,
        messages: &[Value],
        options: &SendOptions,
        emitter: &mut TurnEmitter,
    ) -> Result<(String, Option<Usage>), AgentError> {
        let body = self.request_body(model, messages, true);
        let response = self.post(&body).await?;

        let throttle = Duration::from_millis(self.config.streaming.throttle_ms);
        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut usage: Option<Usage> = None;
        let mut last_emit: Option<Instant> = None;

        loop {
            let chunk = tokio::select! {
                _ = options.cancel.cancelled() => return Err(AgentError::Cancelled),
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|err| {
                if options.cancel.is_cancelled() {
                    AgentError::Cancelled
                } else {
                    AgentError::Transport(err.to_string())
                }
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                    continue;
                };
                match event.get("type").and_then(Value::as_str) {
                    Some("content_block_delta") => {
                        match event.pointer("/delta/type").and_then(Value::as_str) {
                            Some("text_delta") => {
                                if let Some(delta) =
                                    event.pointer("/delta/text").and_then(Value::as_str)
                                {
                                    text.push_str(delta);
                                    if last_emit.map_or(true, |at| at.elapsed() >= throttle) {
                                        last_emit = Some(Instant::now());
                                        emitter.emit(&ThreadEvent::ItemUpdated {
                                            item: ThreadItem::AgentMessage {
                                                id: "msg".to_string(),
                                                text: text.clone(),
                                            },
                                        });
                                    }
                                }
                            }
                            Some("thinking_delta") => {
                                if let Some(delta) =
                                    event.pointer("/delta/thinking").and_then(Value::as_str)
                                {
                                    reasoning.push_str(delta);
                                    emitter.emit(&ThreadEvent::ItemUpdated {
                                        item: ThreadItem::Reasoning {
                                            id: "reasoning".to_string(),
                                            text: reasoning.clone(),
                                        },
                                    });
                                }
                            }
                            _ => {}
                        }
                    }
                    Some("message_delta") => {
                        if let Some(output) = event
                            .pointer("/usage/output_tokens")
                            .and_then(Value::as_u64)
                        {
                            let entry = usage.get_or_insert(Usage::default());
                            entry.output_tokens = output;
                        }
                    }
                    Some("message_start") => {
                        if let Some(input) = event
                            .pointer("/message/usage/input_tokens")
                            .and_then(Value::as_u64)
                        {
                            let entry = usage.get_or_insert(Usage::default());
                            entry.input_tokens = input;
                        }
                    }
                    Some("message_stop") => return Ok((text, usage)),
                    Some("error") => {
                        let message = event
                            .pointer("/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("stream error")
                            .to_string();
                        return Err(AgentError::Transport(message));
                    }
                    _ => {}
                }
            }
        }
        // Stream ended without message_stop; treat accumulated text as final.
        if text.is_empty() {
            return Err(AgentError::Transport(
                "stream ended without content".to_string(),
            ));
        }
        Ok((text, usage))
    }

    async fn send_buffered(
        &self,
        model: &str,
        messages: &[Value],
        options: &SendOptions,
        _emitter: &mut TurnEmitter,
    ) -> Result<(String, Option<Usage>), AgentError> {
        let body = self.request_body(model, messages, false);
        let response = tokio::select! {
            _ = options.cancel.cancelled() => return Err(AgentError::Cancelled),
            response = self.post(&body) => response?,
        };
        let value: Value = response
            .json()
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        let text = value
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(AgentError::Transport(
                "anthropic response carried no text content".to_string(),
            ));
        }
        let usage = value
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok());
        Ok((text, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ads_protocol::AgentVendor;

    fn adapter(api_key: &str) -> ClaudeSdkAdapter {
        ClaudeSdkAdapter::new(ClaudeConfig {
            descriptor: AgentDescriptor {
                id: "claude".to_string(),
                name: "Claude".to_string(),
                vendor: AgentVendor::Claude,
                capabilities: vec!["sdk".to_string()],
            },
            api_key: api_key.to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            streaming: StreamingConfig::default(),
        })
    }

    #[tokio::test]
    async fn missing_key_blocks_send() {
        let adapter = adapter("");
        let status = adapter.status().await;
        assert!(!status.ready);
        let err = adapter
            .send(AgentInput::from("hi"), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn reset_forgets_thread_and_history() {
        let adapter = adapter("key");
        {
            let mut state = adapter.state.write().await;
            state.thread_id = Some("th".to_string());
            state.history.push(json!({"role": "user", "content": "x"}));
        }
        adapter.reset().await;
        assert!(adapter.thread_id().await.is_none());
        assert!(adapter.state.read().await.history.is_empty());
    }
}
