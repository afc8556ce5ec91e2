// Agent descriptors and runtime status shared by every adapter variant.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentVendor {
    Codex,
    Claude,
    Amp,
    Gemini,
    Droid,
}

impl AgentVendor {
    /// Whether a model identifier plausibly belongs to this vendor. Model
    /// broadcasts that do not match are silently ignored by the adapter.
    pub fn matches_model(&self, model: &str) -> bool {
        let m = model.trim().to_ascii_lowercase();
        match self {
            AgentVendor::Codex => {
                m.starts_with("gpt") || m.starts_with("o") || m.starts_with("codex")
            }
            AgentVendor::Claude => m.starts_with("claude"),
            AgentVendor::Gemini => m.starts_with("gemini"),
            AgentVendor::Amp => m.starts_with("amp"),
            AgentVendor::Droid => m.starts_with("droid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub vendor: AgentVendor,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Mutable runtime status of one adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    pub ready: bool,
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentStatus {
    pub fn ready() -> Self {
        Self {
            ready: true,
            streaming: false,
            error: None,
        }
    }

    pub fn unready(error: impl Into<String>) -> Self {
        Self {
            ready: false,
            streaming: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub throttle_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            throttle_ms: 150,
        }
    }
}

/// Governs what a spawned agent subprocess may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl Default for SandboxMode {
    fn default() -> Self {
        SandboxMode::WorkspaceWrite
    }
}
