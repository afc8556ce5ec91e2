pub mod probe;
pub mod runner;

pub use probe::{AvailabilityProber, ProbeRecord};
pub use runner::{
    run_capture, run_json_lines, terminate_child, CaptureOutcome, RunOptions, RunOutcome,
    RunnerError,
};
