// Coordination wire shapes
// TaskSpec / TaskResult / SupervisorVerdict / VerificationReport exchanged
// between the supervisor, delegates, and the verification runner.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Submitted,
    Accepted,
    Rejected,
    Rework,
    Done,
    Failed,
    NeedsClarification,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Submitted => "SUBMITTED",
            TaskStatus::Accepted => "ACCEPTED",
            TaskStatus::Rejected => "REJECTED",
            TaskStatus::Rework => "REWORK",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::NeedsClarification => "NEEDS_CLARIFICATION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PENDING" => TaskStatus::Pending,
            "ASSIGNED" => TaskStatus::Assigned,
            "IN_PROGRESS" => TaskStatus::InProgress,
            "SUBMITTED" => TaskStatus::Submitted,
            "ACCEPTED" => TaskStatus::Accepted,
            "REJECTED" => TaskStatus::Rejected,
            "REWORK" => TaskStatus::Rework,
            "DONE" => TaskStatus::Done,
            "FAILED" => TaskStatus::Failed,
            "NEEDS_CLARIFICATION" => TaskStatus::NeedsClarification,
            _ => return None,
        })
    }

    /// Terminal under a supervisor round.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    pub agent_id: String,
    pub revision: u32,
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub verification: VerificationSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSpec {
    #[serde(default)]
    pub commands: Vec<VerifyCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ui_smokes: Vec<UiSmoke>,
}

impl VerificationSpec {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.ui_smokes.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCommand {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub assert_contains: Vec<String>,
    #[serde(default)]
    pub assert_not_contains: Vec<String>,
    #[serde(default)]
    pub assert_regex: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedService {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSmoke {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ManagedService>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_timeout_ms: Option<u64>,
    #[serde(default)]
    pub steps: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Submitted,
    NeedsClarification,
    Failed,
}

impl TaskResultStatus {
    pub fn task_status(&self) -> TaskStatus {
        match self {
            TaskResultStatus::Submitted => TaskStatus::Submitted,
            TaskResultStatus::NeedsClarification => TaskStatus::NeedsClarification,
            TaskResultStatus::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub revision: u32,
    pub status: TaskResultStatus,
    pub summary: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub how_to_verify: Vec<String>,
    #[serde(default)]
    pub known_risks: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskResultError {
    #[error("missing TaskResult JSON payload")]
    MissingPayload,
    #[error("invalid TaskResult schema")]
    InvalidSchema,
}

impl TaskResult {
    /// Locate and validate a TaskResult inside free-form agent output.
    pub fn from_agent_output(text: &str) -> Result<Self, TaskResultError> {
        let payload =
            crate::delegation::extract_json_payload(text).ok_or(TaskResultError::MissingPayload)?;
        let result: TaskResult =
            serde_json::from_str(&payload).map_err(|_| TaskResultError::InvalidSchema)?;
        if result.task_id.trim().is_empty() || result.summary.trim().is_empty() {
            return Err(TaskResultError::InvalidSchema);
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictEntry {
    pub task_id: String,
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorVerdict {
    pub verdicts: Vec<VerdictEntry>,
}

impl SupervisorVerdict {
    /// Accepts either `{"verdicts": [...]}` or a bare verdict array.
    pub fn from_supervisor_output(text: &str) -> Option<Self> {
        let payload = crate::delegation::extract_json_payload(text)?;
        if let Ok(verdict) = serde_json::from_str::<SupervisorVerdict>(&payload) {
            return Some(verdict);
        }
        serde_json::from_str::<Vec<VerdictEntry>>(&payload)
            .ok()
            .map(|verdicts| SupervisorVerdict { verdicts })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub ok: bool,
    pub expected_exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub enabled: bool,
    #[serde(default)]
    pub results: Vec<VerificationResult>,
}

impl VerificationReport {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            results: Vec::new(),
        }
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }
}
