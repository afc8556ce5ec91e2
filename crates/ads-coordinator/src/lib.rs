pub mod coordinator;
pub mod locks;
pub mod verify;

#[cfg(test)]
mod concurrency_tests;

pub use coordinator::{
    CoordinationOutcome, CoordinatorConfig, CoordinatorError, DelegateRunner, SupervisorDriver,
    TaskCoordinator,
};
pub use locks::AgentLockMap;
pub use verify::{run_verification, VerificationContext};
