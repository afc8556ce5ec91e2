// Verification runner
// Deterministic machine checks attached to a task spec: allow-listed
// commands with output assertions, plus browser-driven ui-smoke suites
// against an optionally managed sub-service.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use ads_protocol::{
    UiSmoke, VerificationReport, VerificationResult, VerificationSpec, VerifyCommand,
};
use ads_runtime::runner::{run_capture, terminate_child, RunOptions};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OUTPUT_CAP: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct VerificationContext {
    /// False when ADS_TASK_VERIFICATION_ENABLED or ENABLE_AGENT_EXEC_TOOL
    /// is off; the report then records nothing.
    pub enabled: bool,
    /// Allowed command basenames, resolved from the environment.
    pub allowlist: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    /// Browser-control binary driving ui-smoke steps.
    pub browser_bin: String,
}

impl Default for VerificationContext {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: Vec::new(),
            cwd: None,
            artifacts_dir: None,
            browser_bin: "agent-browser".to_string(),
        }
    }
}

pub async fn run_verification(
    spec: &VerificationSpec,
    ctx: &VerificationContext,
    cancel: &CancellationToken,
) -> VerificationReport {
    if !ctx.enabled {
        return VerificationReport::disabled();
    }
    let mut results = Vec::new();
    for command in &spec.commands {
        if cancel.is_cancelled() {
            break;
        }
        results.push(run_command(command, ctx, cancel).await);
    }
    for smoke in &spec.ui_smokes {
        if cancel.is_cancelled() {
            break;
        }
        results.extend(run_ui_smoke(smoke, ctx, cancel).await);
    }
    VerificationReport {
        enabled: true,
        results,
    }
}

fn basename(cmd: &str) -> String {
    Path::new(cmd)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| cmd.to_string())
}

fn cap(text: String) -> String {
    if text.len() > OUTPUT_CAP {
        text.chars().take(OUTPUT_CAP).collect()
    } else {
        text
    }
}

fn rejected(command: &VerifyCommand, expected: i32, notes: String) -> VerificationResult {
    VerificationResult {
        cmd: command.cmd.clone(),
        args: command.args.clone(),
        ok: false,
        expected_exit_code: expected,
        exit_code: None,
        signal: None,
        elapsed_ms: 0,
        timed_out: false,
        stdout: String::new(),
        stderr: String::new(),
        suite: None,
        notes: Some(notes),
    }
}

async fn run_command(
    command: &VerifyCommand,
    ctx: &VerificationContext,
    cancel: &CancellationToken,
) -> VerificationResult {
    let expected = command.expect_exit_code.unwrap_or(0);
    let name = basename(&command.cmd);
    if !ctx.allowlist.iter().any(|allowed| allowed == &name) {
        return rejected(
            command,
            expected,
            format!("command `{name}` is not allow-listed"),
        );
    }

    let timeout = command
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
    let outcome = run_capture(
        RunOptions {
            binary: command.cmd.clone(),
            args: command.args.clone(),
            cwd: ctx.cwd.clone(),
            env: Vec::new(),
            stdin_data: None,
            cancel: cancel.clone(),
        },
        Some(timeout),
    )
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => return rejected(command, expected, err.to_string()),
    };

    let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
    let mut notes = Vec::new();
    let mut assertions_ok = true;
    for needle in &command.assert_contains {
        if !combined.contains(needle) {
            assertions_ok = false;
            notes.push(format!("missing expected output `{needle}`"));
        }
    }
    for needle in &command.assert_not_contains {
        if combined.contains(needle) {
            assertions_ok = false;
            notes.push(format!("found forbidden output `{needle}`"));
        }
    }
    for pattern in &command.assert_regex {
        match Regex::new(pattern) {
            Ok(regex) => {
                if !regex.is_match(&combined) {
                    assertions_ok = false;
                    notes.push(format!("regex `{pattern}` did not match"));
                }
            }
            Err(err) => {
                assertions_ok = false;
                notes.push(format!("invalid assertion regex `{pattern}`: {err}"));
            }
        }
    }

    let ok = outcome.exit_code == Some(expected) && !outcome.timed_out && assertions_ok;
    VerificationResult {
        cmd: command.cmd.clone(),
        args: command.args.clone(),
        ok,
        expected_exit_code: expected,
        exit_code: outcome.exit_code,
        signal: None,
        elapsed_ms: outcome.elapsed.as_millis() as u64,
        timed_out: outcome.timed_out,
        stdout: cap(outcome.stdout),
        stderr: cap(outcome.stderr),
        suite: None,
        notes: if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        },
    }
}

async fn run_ui_smoke(
    smoke: &UiSmoke,
    ctx: &VerificationContext,
    cancel: &CancellationToken,
) -> Vec<VerificationResult> {
    let mut results = Vec::new();
    let grace = smoke
        .shutdown_grace_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SHUTDOWN_GRACE);

    let mut service = match &smoke.service {
        Some(service) => {
            let mut cmd = tokio::process::Command::new(&service.cmd);
            cmd.args(&service.args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let Some(cwd) = service.cwd.as_deref().map(PathBuf::from).or(ctx.cwd.clone()) {
                cmd.current_dir(cwd);
            }
            match cmd.spawn() {
                Ok(child) => Some(child),
                Err(err) => {
                    results.push(smoke_failure(
                        smoke,
                        format!("failed to start managed service: {err}"),
                    ));
                    return results;
                }
            }
        }
        None => None,
    };

    let ready = match &smoke.ready_url {
        Some(url) => {
            let timeout = smoke
                .ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_READY_TIMEOUT);
            wait_for_ready(url, timeout, cancel).await
        }
        None => true,
    };

    if !ready {
        results.push(smoke_failure(
            smoke,
            format!(
                "service never became ready at {}",
                smoke.ready_url.as_deref().unwrap_or("?")
            ),
        ));
    } else {
        for step in &smoke.steps {
            if cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();
            let outcome = run_capture(
                RunOptions {
                    binary: ctx.browser_bin.clone(),
                    args: step.clone(),
                    cwd: ctx.cwd.clone(),
                    env: Vec::new(),
                    stdin_data: None,
                    cancel: cancel.clone(),
                },
                Some(DEFAULT_STEP_TIMEOUT),
            )
            .await;

            let (ok, exit_code, timed_out, stdout, stderr, mut notes) = match outcome {
                Ok(outcome) => (
                    outcome.exit_code == Some(0) && !outcome.timed_out,
                    outcome.exit_code,
                    outcome.timed_out,
                    cap(outcome.stdout),
                    cap(outcome.stderr),
                    None,
                ),
                Err(err) => (false, None, false, String::new(), String::new(), Some(err.to_string())),
            };

            if !ok {
                if let Some(path) = capture_screenshot(smoke, ctx, cancel).await {
                    let note = format!("screenshot saved to {}", path.display());
                    notes = Some(match notes {
                        Some(existing) => format!("{existing}; {note}"),
                        None => note,
                    });
                }
            }

            results.push(VerificationResult {
                cmd: ctx.browser_bin.clone(),
                args: step.clone(),
                ok,
                expected_exit_code: 0,
                exit_code,
                signal: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
                timed_out,
                stdout,
                stderr,
                suite: Some(smoke.name.clone()),
                notes,
            });

            if !ok {
                break;
            }
        }
    }

    // The managed service is always stopped, pass or fail.
    if let Some(child) = service.as_mut() {
        let _ = terminate_child(child, grace).await;
    }

    results
}

fn smoke_failure(smoke: &UiSmoke, notes: String) -> VerificationResult {
    VerificationResult {
        cmd: smoke
            .service
            .as_ref()
            .map(|service| service.cmd.clone())
            .unwrap_or_else(|| "ui-smoke".to_string()),
        args: Vec::new(),
        ok: false,
        expected_exit_code: 0,
        exit_code: None,
        signal: None,
        elapsed_ms: 0,
        timed_out: false,
        stdout: String::new(),
        stderr: String::new(),
        suite: Some(smoke.name.clone()),
        notes: Some(notes),
    }
}

async fn wait_for_ready(url: &str, timeout: Duration, cancel: &CancellationToken) -> bool {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return false;
        }
        if let Ok(response) = client.get(url).send().await {
            if response.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    false
}

async fn capture_screenshot(
    smoke: &UiSmoke,
    ctx: &VerificationContext,
    cancel: &CancellationToken,
) -> Option<PathBuf> {
    let dir = ctx.artifacts_dir.as_ref()?;
    let _ = std::fs::create_dir_all(dir);
    let path = dir.join(format!("{}-failure.png", smoke.name));
    let outcome = run_capture(
        RunOptions {
            binary: ctx.browser_bin.clone(),
            args: vec!["screenshot".to_string(), path.display().to_string()],
            cwd: ctx.cwd.clone(),
            env: Vec::new(),
            stdin_data: None,
            cancel: cancel.clone(),
        },
        Some(Duration::from_secs(15)),
    )
    .await;
    match outcome {
        Ok(outcome) if outcome.exit_code == Some(0) => Some(path),
        _ => None,
    }
}

/// Render a report as the text summary handed back to the supervisor.
pub fn format_report(report: &VerificationReport) -> String {
    if !report.enabled {
        return "verification disabled".to_string();
    }
    if report.results.is_empty() {
        return "no verification attached".to_string();
    }
    let mut lines = Vec::new();
    for result in &report.results {
        let mark = if result.ok { "PASS" } else { "FAIL" };
        let mut line = format!(
            "[{mark}] {} {} (exit {:?}, {} ms)",
            result.cmd,
            result.args.join(" "),
            result.exit_code,
            result.elapsed_ms
        );
        if result.timed_out {
            line.push_str(" [timed out]");
        }
        if let Some(notes) = &result.notes {
            line.push_str(&format!(" — {notes}"));
        }
        lines.push(line);
    }
    lines.join("\n")
}
