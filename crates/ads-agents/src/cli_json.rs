// CLI-JSON adapter
// Drives an agent CLI subprocess (`exec ... --json -`) with the prompt on
// stdin and maps its stdout lines into the canonical event stream. Lines
// that already carry the canonical vocabulary are decoded directly; vendor
// stream-JSON lines go through the stream parser.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use ads_protocol::thread::DecodeOutcome;
use ads_protocol::{
    decode_line, AgentDescriptor, AgentStatus, ProgressEvent, SandboxMode, StreamingConfig,
    ThreadEvent, ThreadItem,
};
use ads_runtime::runner::{run_json_lines, RunOptions, RunnerError};

use crate::adapter::{
    check_output_schema, AgentAdapter, AgentError, AgentInput, AgentReply, SendOptions,
    TurnEmitter,
};
use crate::stream::StreamParser;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct CliJsonConfig {
    pub descriptor: AgentDescriptor,
    pub binary: String,
    pub sandbox: SandboxMode,
    pub default_model: Option<String>,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Default)]
struct MutableState {
    cwd: Option<PathBuf>,
    model: Option<String>,
    thread_id: Option<String>,
    streaming: bool,
    last_error: Option<String>,
}

pub struct CliJsonAdapter {
    config: CliJsonConfig,
    state: RwLock<MutableState>,
    events: broadcast::Sender<ProgressEvent>,
}

impl CliJsonAdapter {
    pub fn new(config: CliJsonConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let model = config.default_model.clone();
        Self {
            config,
            state: RwLock::new(MutableState {
                model,
                ..Default::default()
            }),
            events,
        }
    }

    fn build_args(
        &self,
        thread_id: Option<&str>,
        cwd: Option<&PathBuf>,
        model: Option<&str>,
        images: &[PathBuf],
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(tid) = thread_id {
            args.push("resume".to_string());
            args.push(tid.to_string());
        }
        if let Some(cwd) = cwd {
            args.push("--cd".to_string());
            args.push(cwd.display().to_string());
        }
        match self.config.sandbox {
            SandboxMode::ReadOnly => {
                args.push("--sandbox".to_string());
                args.push("read-only".to_string());
            }
            SandboxMode::WorkspaceWrite => args.push("--full-auto".to_string()),
            SandboxMode::DangerFullAccess => {
                args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
            }
        }
        args.push("--json".to_string());
        args.push("--skip-git-repo-check".to_string());
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        for image in images {
            args.push("--image".to_string());
            args.push(image.display().to_string());
        }
        args.push("-".to_string());
        args
    }
}

#[async_trait]
impl AgentAdapter for CliJsonAdapter {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.config.descriptor
    }

    async fn status(&self) -> AgentStatus {
        let state = self.state.read().await;
        if self.config.binary.trim().is_empty() {
            return AgentStatus::unready("no binary configured");
        }
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

        let (prompt, images) = input.flatten();
        let (thread_id, cwd, model) = {
            let mut state = self.state.write().await;
            state.streaming = true;
            (state.thread_id.clone(), state.cwd.clone(), state.model.clone())
        };

        let args = self.build_args(thread_id.as_deref(), cwd.as_ref(), model.as_deref(), &images);
        tracing::debug!(agent = %self.config.descriptor.id, ?args, "spawning agent cli");

        let mut parser = StreamParser::new();
        let mut emitter = TurnEmitter::new(self.events.clone(), options.streaming);
        let mut observed_thread_id: Option<String> = None;
        let mut final_message = String::new();
        let mut usage = None;
        let mut failure: Option<String> = None;

        let run = run_json_lines(
            RunOptions {
                binary: self.config.binary.clone(),
                args,
                cwd: cwd.clone(),
                env: Vec::new(),
                stdin_data: Some(prompt),
                cancel: options.cancel.clone(),
            },
            |raw: &Value| {
                let events = match decode_line(raw) {
                    DecodeOutcome::Event(event) => vec![event],
                    DecodeOutcome::Malformed(reason) => vec![ThreadEvent::Error {
                        message: reason,
                    }],
                    DecodeOutcome::Unknown => parser.push_line(raw),
                };
                for event in events {
                    match &event {
                        ThreadEvent::ThreadStarted { thread_id } => {
                            if observed_thread_id.is_none() {
                                observed_thread_id = Some(thread_id.clone());
                            }
                        }
                        ThreadEvent::ItemCompleted {
                            item: ThreadItem::AgentMessage { text, .. },
                        }
                        | ThreadEvent::ItemUpdated {
                            item: ThreadItem::AgentMessage { text, .. },
                        } => {
                            final_message = text.clone();
                        }
                        ThreadEvent::TurnCompleted { usage: u } => usage = *u,
                        ThreadEvent::TurnFailed { error } => {
                            failure = Some(error.message.clone());
                        }
                        _ => {}
                    }
                    emitter.emit(&event);
                }
            },
        )
        .await;

        let outcome = {
            let mut state = self.state.write().await;
            state.streaming = false;
            match run {
                Ok(outcome) => outcome,
                Err(err) => {
                    let message = match &err {
                        RunnerError::BinaryNotFound(binary) => {
                            format!("agent binary not found: {binary}")
                        }
                        other => other.to_string(),
                    };
                    state.last_error = Some(message.clone());
                    drop(state);
                    emitter.fail_if_open(&message);
                    return Err(AgentError::Transport(message));
                }
            }
        };

        if outcome.cancelled {
            emitter.fail_if_open("aborted");
            return Err(AgentError::Cancelled);
        }

        if let Some(message) = failure {
            emitter.fail_if_open(&message);
            self.state.write().await.last_error = Some(message.clone());
            return Err(AgentError::Transport(message));
        }

        if final_message.is_empty() {
            final_message = parser.final_message().to_string();
        }

        if !emitter.terminal_emitted() {
            if outcome.exit_code == Some(0) && !final_message.is_empty() {
                emitter.complete_if_open(usage);
            } else {
                let stderr = outcome.stderr.trim();
                let message = if stderr.is_empty() {
                    format!("agent exited with code {:?}", outcome.exit_code)
                } else {
                    stderr.chars().take(400).collect()
                };
                emitter.fail_if_open(&message);
                self.state.write().await.last_error = Some(message.clone());
                return Err(AgentError::Transport(message));
            }
        }

        {
            let mut state = self.state.write().await;
            if let Some(tid) = observed_thread_id {
                state.thread_id = Some(tid);
            }
            state.last_error = None;
        }

        if let Some(schema) = &options.output_schema {
            check_output_schema(&final_message, schema)?;
        }

        Ok(AgentReply {
            response: final_message,
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
        state.last_error = None;
    }

    async fn resume_thread(&self, thread_id: String) {
        self.state.write().await.thread_id = Some(thread_id);
    }

    async fn set_working_directory(&self, cwd: PathBuf) {
        self.state.write().await.cwd = Some(cwd);
    }

    async fn set_model(&self, model: String) {
        self.state.write().await.model = Some(model);
    }

    async fn thread_id(&self) -> Option<String> {
        self.state.read().await.thread_id.clone()
    }

    fn streaming_config(&self) -> StreamingConfig {
        self.config.streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ads_protocol::{AgentVendor, EventPhase};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor {
            id: "codex".to_string(),
            name: "Codex".to_string(),
            vendor: AgentVendor::Codex,
            capabilities: vec!["cli".to_string()],
        }
    }

    #[cfg(unix)]
    fn fake_agent(dir: &std::path::Path, script_body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn adapter_for(binary: String) -> CliJsonAdapter {
        CliJsonAdapter::new(CliJsonConfig {
            descriptor: descriptor(),
            binary,
            sandbox: SandboxMode::WorkspaceWrite,
            default_model: None,
            streaming: StreamingConfig::default(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn canonical_lines_produce_reply_and_thread_id() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_agent(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"thread.started","thread_id":"th-42"}'
echo '{"type":"turn.started"}'
echo '{"type":"item.completed","item":{"item_type":"agent_message","id":"m1","text":"hi there"}}'
echo '{"type":"turn.completed"}'"#,
        );
        let adapter = adapter_for(binary);
        let mut rx = adapter.subscribe();

        let reply = adapter
            .send(AgentInput::from("hello"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.response, "hi there");
        assert_eq!(adapter.thread_id().await.as_deref(), Some("th-42"));

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert_eq!(
            phases.iter().filter(|p| **p == EventPhase::Completed).count(),
            1
        );
        assert_eq!(phases.first(), Some(&EventPhase::Connection));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vendor_lines_route_through_stream_parser() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_agent(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-9"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"haiku"}]}}'
echo '{"type":"result","subtype":"success"}'"#,
        );
        let adapter = adapter_for(binary);
        let reply = adapter
            .send(AgentInput::from("write"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.response, "haiku");
        assert_eq!(adapter.thread_id().await.as_deref(), Some("sess-9"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_fails_turn_with_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_agent(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"thread.started","thread_id":"th-1"}'
sleep 30"#,
        );
        let adapter = adapter_for(binary);
        let mut rx = adapter.subscribe();
        let cancel = CancellationToken::new();
        let options = SendOptions {
            cancel: cancel.clone(),
            ..Default::default()
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = adapter.send(AgentInput::from("go"), options).await.unwrap_err();
        assert!(err.is_cancelled());

        let mut terminal = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.phase == EventPhase::Error && event.title == "turn failed" {
                terminal.push(event.detail.unwrap_or_default());
            }
        }
        assert_eq!(terminal, vec!["aborted".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn turn_failed_maps_to_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_agent(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"turn.failed","error":{"message":"quota exhausted"}}'"#,
        );
        let adapter = adapter_for(binary);
        let err = adapter
            .send(AgentInput::from("x"), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(message) if message == "quota exhausted"));
    }

    #[tokio::test]
    async fn resume_and_sandbox_flags_are_composed() {
        let adapter = adapter_for("codex".to_string());
        let args = adapter.build_args(
            Some("th-7"),
            Some(&PathBuf::from("/work")),
            Some("gpt-5"),
            &[PathBuf::from("/tmp/a.png")],
        );
        assert_eq!(
            args,
            vec![
                "exec",
                "resume",
                "th-7",
                "--cd",
                "/work",
                "--full-auto",
                "--json",
                "--skip-git-repo-check",
                "--model",
                "gpt-5",
                "--image",
                "/tmp/a.png",
                "-",
            ]
        );
    }

    #[tokio::test]
    async fn reset_clears_thread() {
        let adapter = adapter_for("codex".to_string());
        adapter.state.write().await.thread_id = Some("th-1".to_string());
        adapter.reset().await;
        assert!(adapter.thread_id().await.is_none());
    }
}
