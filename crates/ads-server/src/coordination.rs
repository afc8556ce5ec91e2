// Coordination glue
// Bridges the orchestrator into the task coordinator's traits and runs the
// supervisor-delegate-verify loop over a supervisor reply that contains
// delegation blocks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ads_agents::{AgentError, AgentInput, SendOptions};
use ads_coordinator::{
    CoordinatorConfig, DelegateRunner, SupervisorDriver, TaskCoordinator, VerificationContext,
};
use ads_core::{AdsConfig, Orchestrator};
use ads_protocol::parse_delegations;
use ads_store::{Scope, TaskStore};

pub struct OrchestratorDelegateRunner {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl DelegateRunner for OrchestratorDelegateRunner {
    fn known_agent(&self, agent_id: &str) -> bool {
        self.orchestrator.resolve(agent_id).is_some()
    }

    fn agent_name(&self, agent_id: &str) -> Option<String> {
        self.orchestrator
            .resolve(agent_id)
            .map(|adapter| adapter.descriptor().name.clone())
    }

    async fn invoke(
        &self,
        agent_id: &str,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        let reply = self
            .orchestrator
            .invoke_agent(
                agent_id,
                AgentInput::Text(prompt),
                SendOptions {
                    streaming: false,
                    cancel,
                    output_schema: None,
                },
            )
            .await?;
        Ok(reply.response)
    }
}

pub struct ActiveAgentSupervisor {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
}

#[async_trait]
impl SupervisorDriver for ActiveAgentSupervisor {
    async fn run(&self, prompt: String) -> Result<String, AgentError> {
        let reply = self
            .orchestrator
            .send_active(
                AgentInput::Text(prompt),
                SendOptions {
                    streaming: false,
                    cancel: self.cancel.child_token(),
                    output_schema: None,
                },
            )
            .await?;
        Ok(reply.response)
    }
}

/// Run the coordination loop over a supervisor reply when it contains
/// delegation blocks; otherwise hand the reply back untouched.
pub async fn coordinate_reply(
    config: &AdsConfig,
    orchestrator: Arc<Orchestrator>,
    store: Arc<TaskStore>,
    namespace: &str,
    session_id: &str,
    supervisor_reply: &str,
    cancel: CancellationToken,
) -> String {
    if !config.coordinator_enabled || parse_delegations(supervisor_reply).is_empty() {
        return supervisor_reply.to_string();
    }

    let supervisor_agent_id = orchestrator.active_agent().await;
    let coordinator = TaskCoordinator::new(
        CoordinatorConfig {
            supervisor_agent_id,
            ..Default::default()
        },
        Scope::new(namespace.to_string(), session_id.to_string()),
        store,
        Arc::new(OrchestratorDelegateRunner {
            orchestrator: orchestrator.clone(),
        }),
        VerificationContext {
            enabled: config.verification_enabled && config.exec_tool_enabled,
            allowlist: config.verification_allowlist.clone(),
            ..Default::default()
        },
        cancel.clone(),
    );
    let supervisor = ActiveAgentSupervisor {
        orchestrator,
        cancel,
    };

    match coordinator.run(supervisor_reply, &supervisor).await {
        Ok(outcome) => {
            tracing::info!(rounds = outcome.rounds, "coordination finished");
            outcome.response
        }
        Err(err) => {
            tracing::warn!(error = %err, "coordination aborted");
            supervisor_reply.to_string()
        }
    }
}
