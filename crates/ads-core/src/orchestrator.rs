// Orchestrator
// Registry of adapters with one active agent, event fan-out toward session
// listeners, working-directory/model broadcast, and the delegation
// middleware applied to supervisor replies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use ads_agents::{AgentAdapter, AgentError, AgentInput, AgentReply, SendOptions};
use ads_protocol::{parse_delegations, AgentStatus, EventPhase, ProgressEvent};
use ads_runtime::AvailabilityProber;

const EVENT_FANOUT_CAPACITY: usize = 2048;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown agent `{0}`")]
    UnknownAgent(String),
    #[error("agent `{id}` is not ready: {reason}")]
    NotReady { id: String, reason: String },
}

struct Registered {
    adapter: Arc<dyn AgentAdapter>,
    /// Binary the availability prober checks, when the transport has one.
    binary: Option<String>,
}

pub struct Orchestrator {
    agents: HashMap<String, Registered>,
    order: Vec<String>,
    active: RwLock<String>,
    /// Fan-out toward session listeners; adapter events are relayed here
    /// for the duration of each turn.
    events: broadcast::Sender<ProgressEvent>,
    prober: Arc<AvailabilityProber>,
}

impl Orchestrator {
    pub fn new(prober: Arc<AvailabilityProber>) -> Self {
        let (events, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        Self {
            agents: HashMap::new(),
            order: Vec::new(),
            active: RwLock::new(String::new()),
            events,
            prober,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>, binary: Option<String>) {
        let id = adapter.descriptor().id.clone();
        if !self.agents.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.agents.insert(id.clone(), Registered { adapter, binary });
        let active = self.active.get_mut();
        if active.is_empty() {
            *active = id;
        }
    }

    pub fn agent_ids(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.agents.get(id).map(|entry| entry.adapter.clone())
    }

    /// Resolve by id, or case-insensitively by display name.
    pub fn resolve(&self, id_or_name: &str) -> Option<Arc<dyn AgentAdapter>> {
        if let Some(entry) = self.agents.get(id_or_name) {
            return Some(entry.adapter.clone());
        }
        let wanted = id_or_name.trim().to_ascii_lowercase();
        self.order.iter().find_map(|id| {
            let entry = &self.agents[id];
            let descriptor = entry.adapter.descriptor();
            (descriptor.id.to_ascii_lowercase() == wanted
                || descriptor.name.to_ascii_lowercase() == wanted)
                .then(|| entry.adapter.clone())
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub async fn active_agent(&self) -> String {
        self.active.read().await.clone()
    }

    /// Switching requires the target to be ready; per-agent thread ids are
    /// kept on the adapters and survive the switch.
    pub async fn switch_active(&self, id_or_name: &str) -> Result<String, OrchestratorError> {
        let adapter = self
            .resolve(id_or_name)
            .ok_or_else(|| OrchestratorError::UnknownAgent(id_or_name.to_string()))?;
        let id = adapter.descriptor().id.clone();
        let status = self.merged_status(&id).await;
        if !status.ready {
            return Err(OrchestratorError::NotReady {
                id,
                reason: status.error.unwrap_or_else(|| "unavailable".to_string()),
            });
        }
        *self.active.write().await = id.clone();
        tracing::info!(agent = %id, "active agent switched");
        Ok(id)
    }

    async fn merged_status(&self, id: &str) -> AgentStatus {
        let Some(entry) = self.agents.get(id) else {
            return AgentStatus::unready("unknown agent");
        };
        let status = entry.adapter.status().await;
        match &entry.binary {
            Some(binary) => {
                self.prober.probe(id, binary).await;
                self.prober.merge_status(id, status).await
            }
            None => status,
        }
    }

    /// Descriptor plus probe-merged status for every registered agent, in
    /// registration order.
    pub async fn statuses(&self) -> Vec<(ads_protocol::AgentDescriptor, AgentStatus)> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let descriptor = self.agents[id].adapter.descriptor().clone();
            out.push((descriptor, self.merged_status(id).await));
        }
        out
    }

    /// Forward a send to one adapter, relaying its events to orchestrator
    /// subscribers for the duration of the turn.
    pub async fn invoke_agent(
        &self,
        id: &str,
        input: AgentInput,
        options: SendOptions,
    ) -> Result<AgentReply, AgentError> {
        let adapter = self
            .get(id)
            .ok_or_else(|| AgentError::Config(format!("unknown agent `{id}`")))?;

        let mut rx = adapter.subscribe();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let terminal = matches!(event.phase, EventPhase::Completed)
                    || (matches!(event.phase, EventPhase::Error) && event.title == "turn failed");
                let _ = events.send(event);
                if terminal {
                    break;
                }
            }
        });

        let result = adapter.send(input, options).await;
        // The terminal-event invariant lets the forwarder drain itself; abort
        // only if the adapter broke the contract.
        let mut forwarder = forwarder;
        if tokio::time::timeout(std::time::Duration::from_millis(250), &mut forwarder)
            .await
            .is_err()
        {
            tracing::warn!(agent = id, "event forwarder did not observe a terminal event");
            forwarder.abort();
        }
        result
    }

    pub async fn send_active(
        &self,
        input: AgentInput,
        options: SendOptions,
    ) -> Result<AgentReply, AgentError> {
        let id = self.active_agent().await;
        self.invoke_agent(&id, input, options).await
    }

    /// Broadcast the working directory to every adapter.
    pub async fn set_working_directory(&self, cwd: PathBuf) {
        for id in &self.order {
            self.agents[id]
                .adapter
                .set_working_directory(cwd.clone())
                .await;
        }
    }

    /// Broadcast a model to every adapter whose vendor recognises it; the
    /// rest ignore it silently.
    pub async fn set_model(&self, model: &str) {
        for id in &self.order {
            let adapter = &self.agents[id].adapter;
            if adapter.descriptor().vendor.matches_model(model) {
                adapter.set_model(model.to_string()).await;
            }
        }
    }

    /// Reset every adapter, clearing thread ids.
    pub async fn reset(&self) {
        for id in &self.order {
            self.agents[id].adapter.reset().await;
        }
    }

    /// Delegation middleware: resolve `<<<agent.id>>>` blocks in a
    /// supervisor reply into sub-invocations and splice their summaries
    /// back in place. Duplicate block text replaces the first occurrence
    /// per directive.
    pub async fn apply_delegations(
        &self,
        supervisor_id: &str,
        text: &str,
        cancel: CancellationToken,
    ) -> String {
        let directives = parse_delegations(text);
        if directives.is_empty() {
            return text.to_string();
        }
        let mut output = text.to_string();
        for directive in directives {
            if directive.agent_id.eq_ignore_ascii_case(supervisor_id) {
                continue;
            }
            let replacement = match self.resolve(&directive.agent_id) {
                Some(adapter) => {
                    let name = adapter.descriptor().name.clone();
                    let options = SendOptions {
                        streaming: false,
                        cancel: cancel.clone(),
                        output_schema: None,
                    };
                    match self
                        .invoke_agent(
                            &adapter.descriptor().id.clone(),
                            AgentInput::Text(directive.prompt.clone()),
                            options,
                        )
                        .await
                    {
                        Ok(reply) => format!("🤝 {name}(协作代理)\n{}", reply.response),
                        Err(err) => format!("🤝 {name}(协作代理) 调用失败: {err}"),
                    }
                }
                None => format!("🤝 {}(协作代理) 未注册或未启用,已跳过", directive.agent_id),
            };
            output = output.replacen(&directive.block, &replacement, 1);
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ads_protocol::{
        AgentDescriptor, AgentVendor, StreamingConfig, ThreadEvent, ThreadItem, TurnError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeAdapter {
        descriptor: AgentDescriptor,
        ready: AtomicBool,
        reply: String,
        model: StdMutex<Option<String>>,
        events: broadcast::Sender<ProgressEvent>,
    }

    impl FakeAdapter {
        fn new(id: &str, vendor: AgentVendor, reply: &str) -> Arc<Self> {
            let (events, _) = broadcast::channel(64);
            Arc::new(Self {
                descriptor: AgentDescriptor {
                    id: id.to_string(),
                    name: id.to_string(),
                    vendor,
                    capabilities: vec![],
                },
                ready: AtomicBool::new(true),
                reply: reply.to_string(),
                model: StdMutex::new(None),
                events,
            })
        }

        fn emit(&self, event: &ThreadEvent) {
            if let Some(progress) = ads_protocol::progress_for(event) {
                let _ = self.events.send(progress);
            }
        }
    }

    #[async_trait]
    impl AgentAdapter for FakeAdapter {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn status(&self) -> AgentStatus {
            if self.ready.load(Ordering::SeqCst) {
                AgentStatus::ready()
            } else {
                AgentStatus::unready("offline")
            }
        }

        async fn send(
            &self,
            _input: AgentInput,
            options: SendOptions,
        ) -> Result<AgentReply, AgentError> {
            if options.cancel.is_cancelled() {
                self.emit(&ThreadEvent::TurnFailed {
                    error: TurnError {
                        message: "aborted".to_string(),
                    },
                });
                return Err(AgentError::Cancelled);
            }
            self.emit(&ThreadEvent::TurnStarted);
            self.emit(&ThreadEvent::ItemCompleted {
                item: ThreadItem::AgentMessage {
                    id: "msg".to_string(),
                    text: self.reply.clone(),
                },
            });
            self.emit(&ThreadEvent::TurnCompleted { usage: None });
            Ok(AgentReply {
                response: self.reply.clone(),
                usage: None,
                agent_id: self.descriptor.id.clone(),
            })
        }

        fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
            self.events.subscribe()
        }

        async fn reset(&self) {}

        async fn set_working_directory(&self, _cwd: PathBuf) {}

        async fn set_model(&self, model: String) {
            *self.model.lock().unwrap() = Some(model);
        }

        async fn thread_id(&self) -> Option<String> {
            None
        }

        fn streaming_config(&self) -> StreamingConfig {
            StreamingConfig::default()
        }
    }

    fn orchestrator_with(adapters: Vec<Arc<FakeAdapter>>) -> Orchestrator {
        let mut orchestrator = Orchestrator::new(Arc::new(AvailabilityProber::default()));
        for adapter in adapters {
            orchestrator.register(adapter, None);
        }
        orchestrator
    }

    #[tokio::test]
    async fn first_registered_agent_becomes_active() {
        let orchestrator = orchestrator_with(vec![
            FakeAdapter::new("codex", AgentVendor::Codex, "a"),
            FakeAdapter::new("claude", AgentVendor::Claude, "b"),
        ]);
        assert_eq!(orchestrator.active_agent().await, "codex");
    }

    #[tokio::test]
    async fn switch_requires_ready_target() {
        let codex = FakeAdapter::new("codex", AgentVendor::Codex, "a");
        let claude = FakeAdapter::new("claude", AgentVendor::Claude, "b");
        claude.ready.store(false, Ordering::SeqCst);
        let orchestrator = orchestrator_with(vec![codex, claude]);

        let err = orchestrator.switch_active("claude").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotReady { .. }));
        assert_eq!(orchestrator.active_agent().await, "codex");
    }

    #[tokio::test]
    async fn model_broadcast_respects_vendor() {
        let codex = FakeAdapter::new("codex", AgentVendor::Codex, "a");
        let gemini = FakeAdapter::new("gemini", AgentVendor::Gemini, "b");
        let orchestrator = orchestrator_with(vec![codex.clone(), gemini.clone()]);

        orchestrator.set_model("gemini-2.0-flash").await;
        assert!(codex.model.lock().unwrap().is_none());
        assert_eq!(
            gemini.model.lock().unwrap().as_deref(),
            Some("gemini-2.0-flash")
        );
    }

    #[tokio::test]
    async fn invoke_forwards_events_to_subscribers() {
        let orchestrator =
            orchestrator_with(vec![FakeAdapter::new("codex", AgentVendor::Codex, "hey")]);
        let mut rx = orchestrator.subscribe();
        orchestrator
            .invoke_agent("codex", AgentInput::from("hi"), SendOptions::default())
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert!(phases.contains(&EventPhase::Completed));
    }

    #[tokio::test]
    async fn delegation_blocks_are_replaced_in_place() {
        let orchestrator = orchestrator_with(vec![
            FakeAdapter::new("codex", AgentVendor::Codex, "supervisor"),
            FakeAdapter::new("claude", AgentVendor::Claude, "a fine haiku"),
        ]);
        let text = "plan:\n<<<agent.claude\nWrite a haiku\n>>>\ndone";
        let output = orchestrator
            .apply_delegations("codex", text, CancellationToken::new())
            .await;
        assert!(output.contains("🤝 claude(协作代理)\na fine haiku"));
        assert!(!output.contains("<<<agent.claude"));
        assert!(output.starts_with("plan:"));
        assert!(output.ends_with("done"));
    }

    #[tokio::test]
    async fn unknown_delegate_is_stubbed() {
        let orchestrator =
            orchestrator_with(vec![FakeAdapter::new("codex", AgentVendor::Codex, "s")]);
        let text = "<<<agent.ghost\ndo a thing\n>>>";
        let output = orchestrator
            .apply_delegations("codex", text, CancellationToken::new())
            .await;
        assert!(output.contains("ghost(协作代理)"));
        assert!(output.contains("跳过"));
    }

    #[tokio::test]
    async fn supervisor_loopback_is_ignored() {
        let orchestrator =
            orchestrator_with(vec![FakeAdapter::new("codex", AgentVendor::Codex, "s")]);
        let text = "<<<agent.codex\nloop\n>>>";
        let output = orchestrator
            .apply_delegations("codex", text, CancellationToken::new())
            .await;
        assert_eq!(output, text);
    }
}
