// Session manager
// One record per user: an orchestrator instance, the current working
// directory, an optional conversation logger, and a last-activity stamp
// used by the idle cleanup task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use ads_agents::{
    AgentAdapter, AgentError, AgentInput, AgentReply, CliJsonAdapter, CliJsonConfig,
    ClaudeConfig, ClaudeSdkAdapter, GeminiConfig, GeminiHttpAdapter, SendOptions,
};
use ads_protocol::{AgentDescriptor, AgentVendor, SandboxMode, StreamingConfig};
use ads_runtime::AvailabilityProber;

use crate::config::{agent_feature_flags, resolve_claude_agent_config, AdsConfig};
use crate::convlog::ConversationLogger;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::threads::{ThreadRecord, ThreadStore};

pub const DEFAULT_AGENT: &str = "codex";

pub struct Session {
    pub user_id: String,
    pub orchestrator: Arc<Orchestrator>,
    cwd: RwLock<PathBuf>,
    last_activity: RwLock<Instant>,
    logger: Mutex<Option<ConversationLogger>>,
}

impl Session {
    pub async fn cwd(&self) -> PathBuf {
        self.cwd.read().await.clone()
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }
}

pub struct SessionManager {
    config: Arc<AdsConfig>,
    state_dir: PathBuf,
    threads: Arc<ThreadStore>,
    prober: Arc<AvailabilityProber>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: AdsConfig, state_dir: PathBuf) -> Arc<Self> {
        let prober = Arc::new(AvailabilityProber::new(Duration::from_millis(
            config.probe_timeout_ms,
        )));
        let threads = Arc::new(ThreadStore::load(state_dir.join("threads.json")));
        Arc::new(Self {
            config: Arc::new(config),
            state_dir,
            threads,
            prober,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AdsConfig {
        &self.config
    }

    pub fn threads(&self) -> Arc<ThreadStore> {
        self.threads.clone()
    }

    /// Lazily create the per-user session. With `resume_thread`, persisted
    /// thread ids (and the cwd they were produced under) are seeded into
    /// the adapters.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        cwd: PathBuf,
        resume_thread: bool,
    ) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(user_id) {
            session.touch().await;
            return session.clone();
        }

        let mut orchestrator = Orchestrator::new(self.prober.clone());
        self.register_adapters(&mut orchestrator);
        let orchestrator = Arc::new(orchestrator);

        let mut effective_cwd = cwd;
        if resume_thread {
            for id in orchestrator.agent_ids().to_vec() {
                if let Some(record) = self.threads.get(user_id, &id).await {
                    if let Some(adapter) = orchestrator.get(&id) {
                        adapter.resume_thread(record.thread_id.clone()).await;
                    }
                    if id == DEFAULT_AGENT {
                        if let Some(saved_cwd) = record.cwd {
                            effective_cwd = saved_cwd;
                        }
                    }
                }
            }
        }
        orchestrator.set_working_directory(effective_cwd.clone()).await;

        let session = Arc::new(Session {
            user_id: user_id.to_string(),
            orchestrator,
            cwd: RwLock::new(effective_cwd),
            last_activity: RwLock::new(Instant::now()),
            logger: Mutex::new(Some(ConversationLogger::new(
                self.state_dir.join("logs"),
                user_id,
            ))),
        });
        tracing::info!(user = user_id, "session created");
        self.sessions
            .write()
            .await
            .insert(user_id.to_string(), session.clone());
        session
    }

    fn register_adapters(&self, orchestrator: &mut Orchestrator) {
        let flags = agent_feature_flags(&self.config);

        let cli = |id: &str, name: &str, vendor: AgentVendor, binary: &str| CliJsonAdapter::new(
            CliJsonConfig {
                descriptor: AgentDescriptor {
                    id: id.to_string(),
                    name: name.to_string(),
                    vendor,
                    capabilities: vec!["cli".to_string()],
                },
                binary: binary.to_string(),
                sandbox: SandboxMode::WorkspaceWrite,
                default_model: None,
                streaming: StreamingConfig::default(),
            },
        );

        // Codex is always present; the rest follow feature flags.
        orchestrator.register(
            Arc::new(cli("codex", "Codex", AgentVendor::Codex, &self.config.codex_bin)),
            Some(self.config.codex_bin.clone()),
        );
        if let Some(binary) = &self.config.amp_bin {
            orchestrator.register(
                Arc::new(cli("amp", "Amp", AgentVendor::Amp, binary)),
                Some(binary.clone()),
            );
        }
        if let Some(binary) = &self.config.droid_bin {
            orchestrator.register(
                Arc::new(cli("droid", "Droid", AgentVendor::Droid, binary)),
                Some(binary.clone()),
            );
        }
        if flags.claude {
            if let Some(claude) = resolve_claude_agent_config(&self.config) {
                orchestrator.register(
                    Arc::new(ClaudeSdkAdapter::new(ClaudeConfig {
                        descriptor: AgentDescriptor {
                            id: "claude".to_string(),
                            name: "Claude".to_string(),
                            vendor: AgentVendor::Claude,
                            capabilities: vec!["sdk".to_string()],
                        },
                        api_key: claude.api_key,
                        model: claude.model,
                        base_url: claude.base_url,
                        streaming: StreamingConfig::default(),
                    })),
                    self.config.claude_bin.clone(),
                );
            }
        }
        if flags.gemini {
            orchestrator.register(
                Arc::new(GeminiHttpAdapter::new(GeminiConfig {
                    descriptor: AgentDescriptor {
                        id: "gemini".to_string(),
                        name: "Gemini".to_string(),
                        vendor: AgentVendor::Gemini,
                        capabilities: vec!["http".to_string()],
                    },
                    api_key: self.config.gemini_api_key.clone().unwrap_or_default(),
                    model: self.config.gemini_model.clone(),
                    base_url: "https://generativelanguage.googleapis.com".to_string(),
                    use_vertex: self.config.gemini_use_vertex,
                })),
                self.config.gemini_bin.clone(),
            );
        }
    }

    /// Broadcast a new cwd and re-stamp the persisted thread records so the
    /// stored cwd always matches the cwd the thread last ran under.
    pub async fn set_user_cwd(&self, user_id: &str, cwd: PathBuf) {
        let Some(session) = self.sessions.read().await.get(user_id).cloned() else {
            return;
        };
        {
            let mut current = session.cwd.write().await;
            if *current == cwd {
                return;
            }
            *current = cwd.clone();
        }
        session.orchestrator.set_working_directory(cwd.clone()).await;
        for id in session.orchestrator.agent_ids().to_vec() {
            if let Some(adapter) = session.orchestrator.get(&id) {
                if let Some(thread_id) = adapter.thread_id().await {
                    self.threads
                        .set(
                            user_id,
                            &id,
                            ThreadRecord {
                                thread_id,
                                cwd: Some(cwd.clone()),
                            },
                        )
                        .await;
                }
            }
        }
        session.touch().await;
    }

    /// Send through the active agent, then write the thread record through.
    pub async fn send(
        &self,
        user_id: &str,
        cwd: PathBuf,
        input: AgentInput,
        options: SendOptions,
    ) -> Result<AgentReply, AgentError> {
        let session = self.get_or_create(user_id, cwd, true).await;
        session.touch().await;

        let prompt_preview = match &input {
            AgentInput::Text(text) => text.clone(),
            AgentInput::Parts(_) => "[multi-part input]".to_string(),
        };
        let active = session.orchestrator.active_agent().await;
        if let Some(logger) = session.logger.lock().await.as_ref() {
            logger.append("user", &active, &prompt_preview);
        }

        let result = session.orchestrator.send_active(input, options).await;

        if let Ok(reply) = &result {
            if let Some(logger) = session.logger.lock().await.as_ref() {
                logger.append("agent", &reply.agent_id, &reply.response);
            }
            self.persist_thread(user_id, &reply.agent_id).await;
        }
        result
    }

    pub async fn persist_thread(&self, user_id: &str, agent_id: &str) {
        let Some(session) = self.sessions.read().await.get(user_id).cloned() else {
            return;
        };
        let Some(adapter) = session.orchestrator.get(agent_id) else {
            return;
        };
        if let Some(thread_id) = adapter.thread_id().await {
            let cwd = session.cwd().await;
            self.threads
                .set(
                    user_id,
                    agent_id,
                    ThreadRecord {
                        thread_id,
                        cwd: Some(cwd),
                    },
                )
                .await;
        }
    }

    pub async fn switch_agent(
        &self,
        user_id: &str,
        target: &str,
    ) -> Result<String, OrchestratorError> {
        let Some(session) = self.sessions.read().await.get(user_id).cloned() else {
            return Err(OrchestratorError::UnknownAgent(target.to_string()));
        };
        session.touch().await;
        session.orchestrator.switch_active(target).await
    }

    /// Close the logger, reset every adapter (clearing thread ids), and
    /// drop the persisted thread records for the user.
    pub async fn reset(&self, user_id: &str) {
        let session = self.sessions.write().await.remove(user_id);
        if let Some(session) = session {
            session.logger.lock().await.take();
            session.orchestrator.reset().await;
        }
        self.threads.clear_user(user_id).await;
        tracing::info!(user = user_id, "session reset");
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Periodic idle cleanup; disabled entirely when the configured timeout
    /// is zero or negative.
    pub fn spawn_idle_cleanup(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let timeout_ms = self.config.session_timeout_ms;
        if timeout_ms <= 0 {
            return None;
        }
        let timeout = Duration::from_millis(timeout_ms as u64);
        let interval = timeout.min(Duration::from_secs(60)).max(Duration::from_millis(100));
        let manager = self.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => manager.cleanup_idle(timeout).await,
                }
            }
        }))
    }

    async fn cleanup_idle(&self, timeout: Duration) {
        let sessions = self.sessions.read().await.clone();
        for (user_id, session) in sessions {
            if session.idle_for().await >= timeout {
                tracing::info!(user = %user_id, "dropping idle session");
                self.sessions.write().await.remove(&user_id);
            }
        }
    }
}
