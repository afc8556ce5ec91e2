// Task coordinator
// Drives the supervisor-delegate-verify loop: parse delegation blocks out
// of a supervisor reply, execute them as durable tasks with per-agent
// serialization, machine-verify the submissions, and feed the outcomes
// back to the supervisor for verdicts until no work remains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ads_agents::AgentError;
use ads_protocol::{
    parse_delegations, DelegationDirective, SupervisorVerdict, TaskResult, TaskSpec, TaskStatus,
    VerificationReport, VerificationSpec,
};
use ads_store::{Scope, StoreError, TaskStore};

use crate::locks::AgentLockMap;
use crate::verify::{format_report, run_verification, VerificationContext};

const VERDICT_RETRY_PROMPT: &str = "Your previous reply did not contain a parseable verdict. \
Reply with ONLY a JSON object of the shape \
{\"verdicts\":[{\"taskId\":\"...\",\"accept\":true,\"note\":\"...\"}]} \
inside a ```json fence. No prose.";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_supervisor_rounds: u32,
    pub max_delegations: usize,
    pub max_parallel_delegations: usize,
    pub task_timeout_ms: u64,
    pub max_task_attempts: u32,
    pub retry_backoff_ms: u64,
    pub supervisor_agent_id: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_supervisor_rounds: 3,
            max_delegations: 6,
            max_parallel_delegations: 2,
            task_timeout_ms: 10 * 60 * 1000,
            max_task_attempts: 2,
            retry_backoff_ms: 1_500,
            supervisor_agent_id: "codex".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Invokes delegate agents. The orchestrator provides the production
/// implementation; tests script it.
#[async_trait]
pub trait DelegateRunner: Send + Sync {
    fn known_agent(&self, agent_id: &str) -> bool;
    fn agent_name(&self, agent_id: &str) -> Option<String>;
    async fn invoke(
        &self,
        agent_id: &str,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<String, AgentError>;
}

/// Runs one supervisor turn and returns its raw reply text.
#[async_trait]
pub trait SupervisorDriver: Send + Sync {
    async fn run(&self, prompt: String) -> Result<String, AgentError>;
}

#[derive(Debug)]
pub struct ExecutedTask {
    pub spec: TaskSpec,
    pub result: Option<TaskResult>,
    pub report: Option<VerificationReport>,
    pub error: Option<String>,
    block: Option<String>,
}

#[derive(Debug)]
pub struct CoordinationOutcome {
    pub response: String,
    pub rounds: u32,
}

pub struct TaskCoordinator {
    config: CoordinatorConfig,
    scope: Scope,
    store: Arc<TaskStore>,
    runner: Arc<dyn DelegateRunner>,
    verification: VerificationContext,
    locks: AgentLockMap,
    cancel: CancellationToken,
}

impl TaskCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        scope: Scope,
        store: Arc<TaskStore>,
        runner: Arc<dyn DelegateRunner>,
        verification: VerificationContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            scope,
            store,
            runner,
            verification,
            locks: AgentLockMap::new(),
            cancel,
        }
    }

    /// Run the coordination loop over an initial supervisor reply. Returns
    /// the user-facing response: the initial text with each executed
    /// delegation block replaced by its delegate's summary, or the
    /// supervisor's last text verbatim when verdict parsing gives up.
    pub async fn run(
        &self,
        initial_response: &str,
        supervisor: &dyn SupervisorDriver,
    ) -> Result<CoordinationOutcome, CoordinatorError> {
        let mut display = initial_response.to_string();
        let mut last_text = initial_response.to_string();
        let mut rework: Vec<TaskSpec> = Vec::new();
        let mut rounds = 0u32;

        while rounds < self.config.max_supervisor_rounds {
            if self.cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled);
            }

            let mut pending: Vec<(TaskSpec, Option<String>)> = Vec::new();
            for directive in parse_delegations(&last_text) {
                if directive
                    .agent_id
                    .eq_ignore_ascii_case(&self.config.supervisor_agent_id)
                {
                    continue;
                }
                if !self.runner.known_agent(&directive.agent_id) {
                    let stub = format!("🤝 {}(协作代理) 未注册或未启用,已跳过", directive.agent_id);
                    display = display.replacen(&directive.block, &stub, 1);
                    continue;
                }
                if pending.len() >= self.config.max_delegations {
                    // Deferred; runs again only if the supervisor re-emits it.
                    tracing::warn!(
                        agent = %directive.agent_id,
                        "delegation dropped for this round: max_delegations reached"
                    );
                    continue;
                }
                pending.push((self.spec_from_directive(&directive), Some(directive.block)));
            }
            while pending.len() < self.config.max_delegations && !rework.is_empty() {
                pending.push((rework.remove(0), None));
            }
            if pending.is_empty() {
                break;
            }
            rounds += 1;

            let executed = self.execute_batch(pending).await?;
            for task in &executed {
                let Some(block) = &task.block else { continue };
                let name = self
                    .runner
                    .agent_name(&task.spec.agent_id)
                    .unwrap_or_else(|| task.spec.agent_id.clone());
                let replacement = match &task.result {
                    Some(result) => format!("🤝 {name}(协作代理)\n{}", result.summary),
                    None => format!(
                        "🤝 {name}(协作代理) 任务失败: {}",
                        task.error.as_deref().unwrap_or("unknown error")
                    ),
                };
                display = display.replacen(block, &replacement, 1);
            }

            let verdict_prompt = build_verdict_prompt(&executed);
            last_text = match supervisor.run(verdict_prompt).await {
                Ok(text) => text,
                Err(err) if err.is_cancelled() => return Err(CoordinatorError::Cancelled),
                Err(err) => {
                    tracing::warn!(error = %err, "supervisor verdict turn failed; stopping");
                    return Ok(CoordinationOutcome {
                        response: display,
                        rounds,
                    });
                }
            };

            let verdict = match SupervisorVerdict::from_supervisor_output(&last_text) {
                Some(verdict) => verdict,
                None => {
                    // One machine-readable-only retry, then halt gracefully.
                    let retry = match supervisor.run(VERDICT_RETRY_PROMPT.to_string()).await {
                        Ok(text) => text,
                        Err(err) if err.is_cancelled() => {
                            return Err(CoordinatorError::Cancelled)
                        }
                        Err(_) => {
                            return Ok(CoordinationOutcome {
                                response: last_text,
                                rounds,
                            })
                        }
                    };
                    match SupervisorVerdict::from_supervisor_output(&retry) {
                        Some(verdict) => {
                            last_text = retry;
                            verdict
                        }
                        None => {
                            tracing::warn!("supervisor verdict unparseable after retry; stopping");
                            return Ok(CoordinationOutcome {
                                response: last_text,
                                rounds,
                            });
                        }
                    }
                }
            };

            for entry in verdict.verdicts {
                let Some(row) = self.store.get_task(&self.scope, &entry.task_id).await? else {
                    tracing::warn!(task = %entry.task_id, "verdict for unknown task ignored");
                    continue;
                };
                // FAILED is terminal under a supervisor round; a verdict
                // cannot resurrect an exhausted task.
                if row.status == TaskStatus::Failed {
                    continue;
                }
                if entry.accept {
                    self.store
                        .set_status(&self.scope, &entry.task_id, TaskStatus::Accepted, None)
                        .await?;
                    self.store
                        .set_status(&self.scope, &entry.task_id, TaskStatus::Done, None)
                        .await?;
                } else {
                    self.store
                        .set_status(
                            &self.scope,
                            &entry.task_id,
                            TaskStatus::Rejected,
                            entry.note.as_deref(),
                        )
                        .await?;
                    let revision = self.store.bump_revision(&self.scope, &entry.task_id).await?;
                    self.store.clear_outputs(&self.scope, &entry.task_id).await?;
                    self.store
                        .set_status(&self.scope, &entry.task_id, TaskStatus::Rework, None)
                        .await?;

                    let mut spec: TaskSpec = serde_json::from_str(&row.spec_json)?;
                    spec.parent_task_id = Some(spec.task_id.clone());
                    spec.revision = revision;
                    if let Some(note) = &entry.note {
                        spec.goal = format!("{}\n\nRework feedback: {note}", spec.goal);
                    }
                    rework.push(spec);
                }
            }
        }

        Ok(CoordinationOutcome {
            response: display,
            rounds,
        })
    }

    /// A delegation block is either a bare goal or a JSON TaskSpec fragment.
    fn spec_from_directive(&self, directive: &DelegationDirective) -> TaskSpec {
        let task_id = format!("task-{}", uuid::Uuid::new_v4());
        if let Some(payload) = ads_protocol::extract_json_payload(&directive.prompt) {
            if let Ok(mut spec) = serde_json::from_str::<TaskSpec>(&payload) {
                spec.task_id = task_id;
                spec.agent_id = directive.agent_id.clone();
                spec.revision = spec.revision.max(1);
                return spec;
            }
        }
        TaskSpec {
            task_id,
            parent_task_id: None,
            agent_id: directive.agent_id.clone(),
            revision: 1,
            goal: directive.prompt.clone(),
            constraints: Vec::new(),
            deliverables: Vec::new(),
            acceptance_criteria: Vec::new(),
            verification: VerificationSpec::default(),
        }
    }

    async fn execute_batch(
        &self,
        pending: Vec<(TaskSpec, Option<String>)>,
    ) -> Result<Vec<ExecutedTask>, CoordinatorError> {
        let parallel = self.config.max_parallel_delegations.max(1);
        let results: Vec<Result<ExecutedTask, CoordinatorError>> =
            futures::stream::iter(
                pending
                    .into_iter()
                    .map(|(spec, block)| self.execute_one(spec, block)),
            )
            .buffered(parallel)
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Execute one task: serialize per agent, retry with linear backoff,
    /// persist the result, then run verification against the spec.
    pub async fn execute_one(
        &self,
        spec: TaskSpec,
        block: Option<String>,
    ) -> Result<ExecutedTask, CoordinatorError> {
        let _guard = self.locks.acquire(&spec.agent_id).await;
        self.store
            .upsert_task(&self.scope, &spec, TaskStatus::Assigned)
            .await?;

        let max_attempts = self.config.max_task_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled);
            }
            self.store
                .set_status(&self.scope, &spec.task_id, TaskStatus::InProgress, None)
                .await?;
            self.store
                .record_attempt(&self.scope, &spec.task_id, attempt)
                .await?;

            let attempt_cancel = self.cancel.child_token();
            let attempt_result = tokio::time::timeout(
                Duration::from_millis(self.config.task_timeout_ms.max(1)),
                self.runner.invoke(
                    &spec.agent_id,
                    delegate_prompt(&spec),
                    attempt_cancel.clone(),
                ),
            )
            .await;

            match attempt_result {
                Err(_) => {
                    attempt_cancel.cancel();
                    last_error = "task attempt timed out".to_string();
                    self.store
                        .append_message(
                            &self.scope,
                            &spec.task_id,
                            "system",
                            Some("timeout"),
                            &last_error,
                        )
                        .await?;
                }
                Ok(Err(err)) if err.is_cancelled() => return Err(CoordinatorError::Cancelled),
                Ok(Err(err)) => {
                    last_error = err.to_string();
                    self.store
                        .append_message(
                            &self.scope,
                            &spec.task_id,
                            "system",
                            Some("transport_error"),
                            &last_error,
                        )
                        .await?;
                }
                Ok(Ok(text)) => match TaskResult::from_agent_output(&text) {
                    Ok(result) => {
                        let result_json = serde_json::to_string(&result)?;
                        self.store
                            .record_result(
                                &self.scope,
                                &spec.task_id,
                                result.status.task_status(),
                                &result_json,
                            )
                            .await?;
                        let report =
                            run_verification(&spec.verification, &self.verification, &self.cancel)
                                .await;
                        self.store
                            .record_verification(
                                &self.scope,
                                &spec.task_id,
                                &serde_json::to_string(&report)?,
                            )
                            .await?;
                        return Ok(ExecutedTask {
                            spec,
                            result: Some(result),
                            report: Some(report),
                            error: None,
                            block,
                        });
                    }
                    Err(err) => {
                        last_error = err.to_string();
                        self.store
                            .append_message(
                                &self.scope,
                                &spec.task_id,
                                "agent",
                                Some("raw_output"),
                                &text,
                            )
                            .await?;
                        self.store
                            .set_status(
                                &self.scope,
                                &spec.task_id,
                                TaskStatus::InProgress,
                                Some(&last_error),
                            )
                            .await?;
                    }
                },
            }

            if attempt < max_attempts {
                let backoff =
                    Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt));
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        self.store
            .set_status(
                &self.scope,
                &spec.task_id,
                TaskStatus::Failed,
                Some(&last_error),
            )
            .await?;
        tracing::warn!(task = %spec.task_id, error = %last_error, "task failed after retries");
        Ok(ExecutedTask {
            spec,
            result: None,
            report: None,
            error: Some(last_error),
            block,
        })
    }
}

fn delegate_prompt(spec: &TaskSpec) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Task ID: {}\n", spec.task_id));
    prompt.push_str(&format!("Revision: {}\n\n", spec.revision));
    prompt.push_str(&format!("Goal:\n{}\n", spec.goal));
    if !spec.constraints.is_empty() {
        prompt.push_str(&format!("\nConstraints:\n- {}\n", spec.constraints.join("\n- ")));
    }
    if !spec.deliverables.is_empty() {
        prompt.push_str(&format!(
            "\nDeliverables:\n- {}\n",
            spec.deliverables.join("\n- ")
        ));
    }
    if !spec.acceptance_criteria.is_empty() {
        prompt.push_str(&format!(
            "\nAcceptance criteria:\n- {}\n",
            spec.acceptance_criteria.join("\n- ")
        ));
    }
    prompt.push_str(&format!(
        "\nWhen finished, reply with a single JSON TaskResult in a ```json fence:\n\
         ```json\n{{\"taskId\":\"{}\",\"revision\":{},\"status\":\"submitted|needs_clarification|failed\",\
         \"summary\":\"...\",\"changedFiles\":[],\"howToVerify\":[],\"knownRisks\":[],\"questions\":[]}}\n```\n",
        spec.task_id, spec.revision
    ));
    prompt
}

fn build_verdict_prompt(executed: &[ExecutedTask]) -> String {
    let mut prompt = String::from(
        "The delegated tasks below have finished. Review each outcome and reply with ONLY a \
         JSON object {\"verdicts\":[{\"taskId\":\"...\",\"accept\":true,\"note\":\"...\"}]} \
         in a ```json fence.\n",
    );
    for task in executed {
        prompt.push_str(&format!(
            "\nTask {} (agent {}, revision {}):\n",
            task.spec.task_id, task.spec.agent_id, task.spec.revision
        ));
        match &task.result {
            Some(result) => {
                prompt.push_str(&format!("  status: {:?}\n", result.status));
                prompt.push_str(&format!("  summary: {}\n", result.summary));
                if !result.questions.is_empty() {
                    prompt.push_str(&format!("  questions: {}\n", result.questions.join("; ")));
                }
            }
            None => {
                prompt.push_str(&format!(
                    "  status: failed\n  error: {}\n",
                    task.error.as_deref().unwrap_or("unknown")
                ));
            }
        }
        if let Some(report) = &task.report {
            prompt.push_str("  verification:\n");
            for line in format_report(report).lines() {
                prompt.push_str(&format!("    {line}\n"));
            }
        }
    }
    prompt
}
