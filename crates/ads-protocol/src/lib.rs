pub mod agent;
pub mod coord;
pub mod delegation;
pub mod event;
pub mod thread;

pub use agent::{AgentDescriptor, AgentStatus, AgentVendor, SandboxMode, StreamingConfig};
pub use coord::{
    ManagedService, SupervisorVerdict, TaskResult, TaskResultError, TaskResultStatus, TaskSpec,
    TaskStatus, UiSmoke, VerdictEntry, VerificationReport, VerificationResult, VerificationSpec,
    VerifyCommand,
};
pub use delegation::{extract_json_payload, parse_delegations, DelegationDirective};
pub use event::{phase_for_item, progress_for, EventPhase, ProgressEvent};
pub use thread::{
    decode_line, DecodeOutcome, ItemStatus, PatchChangeKind, ThreadEvent, ThreadItem, TurnError,
    Usage,
};
