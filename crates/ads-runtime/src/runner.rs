// CLI runner
// Spawns agent subprocesses and streams stdout as JSON lines. Hosts that
// block piped stdio fall back to temp-file redirection parsed after exit.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

const KILL_GRACE: Duration = Duration::from_secs(2);
const STDERR_CAP: usize = 64 * 1024;

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[0-9A-Za-z]").expect("ansi regex"));

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("binary not found: {0}")]
    BinaryNotFound(String),
    #[error("failed to spawn `{binary}`: {message}")]
    Spawn { binary: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin_data: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

fn build_command(opts: &RunOptions) -> Command {
    let mut cmd = Command::new(&opts.binary);
    cmd.args(&opts.args);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
    cmd.kill_on_drop(true);
    cmd
}

fn strip_ansi(line: &str) -> String {
    ANSI_RE.replace_all(line, "").into_owned()
}

fn feed_line<F: FnMut(&Value)>(line: &str, on_line: &mut F) {
    let cleaned = strip_ansi(line);
    let trimmed = cleaned.trim();
    if !trimmed.starts_with('{') {
        return;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        on_line(&value);
    }
}

/// SIGTERM the child, then SIGKILL after the grace window. Returns the exit
/// code when the child was reaped in time.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(_)) => None,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            None
        }
    }
}

async fn terminate(child: &mut Child) -> Option<i32> {
    terminate_child(child, KILL_GRACE).await
}

fn spawn_error(binary: &str, err: std::io::Error) -> RunnerError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RunnerError::BinaryNotFound(binary.to_string())
    } else {
        RunnerError::Spawn {
            binary: binary.to_string(),
            message: err.to_string(),
        }
    }
}

/// Run a subprocess, invoking `on_line` for every stdout line that starts
/// with `{` and parses as JSON. Other lines are skipped silently.
pub async fn run_json_lines<F>(opts: RunOptions, mut on_line: F) -> Result<RunOutcome, RunnerError>
where
    F: FnMut(&Value),
{
    let mut cmd = build_command(&opts);
    cmd.stdin(if opts.stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(spawn_error(&opts.binary, err));
        }
        Err(err) => {
            tracing::warn!(
                binary = %opts.binary,
                error = %err,
                "piped spawn failed; retrying with file-backed stdio"
            );
            return run_json_lines_file_backed(&opts, &mut on_line).await;
        }
    };

    if let Some(data) = &opts.stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Spawn {
            binary: opts.binary.clone(),
            message: "stdout unavailable".to_string(),
        })?;
    let stderr = child.stderr.take();

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let mut chunk = vec![0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if buf.len() < STDERR_CAP {
                            buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
                        }
                    }
                }
            }
        }
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut cancelled = false;
    let mut exit_code = None;

    loop {
        tokio::select! {
            _ = opts.cancel.cancelled(), if !cancelled => {
                cancelled = true;
                exit_code = terminate(&mut child).await;
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => feed_line(&line, &mut on_line),
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(error = %err, "stdout read ended");
                        break;
                    }
                }
            }
        }
    }

    if !cancelled {
        exit_code = child.wait().await.ok().and_then(|status| status.code());
    }
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(RunOutcome {
        exit_code,
        stderr,
        cancelled,
    })
}

/// Fallback path: stdout/stderr redirected to temp files, parsed after exit.
async fn run_json_lines_file_backed<F>(
    opts: &RunOptions,
    on_line: &mut F,
) -> Result<RunOutcome, RunnerError>
where
    F: FnMut(&Value),
{
    let stdout_file = tempfile::NamedTempFile::new()?;
    let stderr_file = tempfile::NamedTempFile::new()?;

    let mut cmd = build_command(opts);
    cmd.stdout(Stdio::from(stdout_file.reopen()?));
    cmd.stderr(Stdio::from(stderr_file.reopen()?));
    if let Some(data) = &opts.stdin_data {
        let mut stdin_file = tempfile::NamedTempFile::new()?;
        stdin_file.write_all(data.as_bytes())?;
        stdin_file.flush()?;
        cmd.stdin(Stdio::from(stdin_file.reopen()?));
    } else {
        cmd.stdin(Stdio::null());
    }

    let mut child = cmd.spawn().map_err(|err| spawn_error(&opts.binary, err))?;

    let mut cancelled = false;
    let exit_code = tokio::select! {
        _ = opts.cancel.cancelled() => {
            cancelled = true;
            terminate(&mut child).await
        }
        status = child.wait() => status.ok().and_then(|s| s.code()),
    };

    let stdout = std::fs::read_to_string(stdout_file.path()).unwrap_or_default();
    for line in stdout.lines() {
        feed_line(line, on_line);
    }
    let stderr = std::fs::read_to_string(stderr_file.path()).unwrap_or_default();

    Ok(RunOutcome {
        exit_code,
        stderr,
        cancelled,
    })
}

/// Run a subprocess to completion, capturing stdout and stderr wholesale.
/// Used by the availability prober and the verification runner.
pub async fn run_capture(
    opts: RunOptions,
    timeout: Option<Duration>,
) -> Result<CaptureOutcome, RunnerError> {
    let started = Instant::now();

    let mut cmd = build_command(&opts);
    cmd.stdin(if opts.stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|err| spawn_error(&opts.binary, err))?;

    if let Some(data) = &opts.stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    // Drain both pipes concurrently; a child that fills one OS pipe buffer
    // while the other is still open would otherwise block forever.
    let reader = async {
        let stdout = async {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        };
        let stderr = async {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        };
        tokio::join!(stdout, stderr)
    };

    let deadline = timeout.unwrap_or(Duration::from_secs(24 * 3600));
    let mut timed_out = false;
    let mut cancelled = false;

    tokio::pin!(reader);
    let (stdout, stderr) = tokio::select! {
        out = &mut reader => out,
        _ = opts.cancel.cancelled() => {
            cancelled = true;
            (String::new(), String::new())
        }
        _ = tokio::time::sleep(deadline) => {
            timed_out = true;
            (String::new(), String::new())
        }
    };

    let exit_code = if timed_out || cancelled {
        terminate(&mut child).await
    } else {
        child.wait().await.ok().and_then(|status| status.code())
    };

    Ok(CaptureOutcome {
        exit_code,
        stdout,
        stderr,
        timed_out,
        cancelled,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> RunOptions {
        RunOptions {
            binary: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streams_only_json_lines() {
        let mut seen = Vec::new();
        let outcome = run_json_lines(
            sh("echo 'plain text'; echo '{\"type\":\"x\",\"n\":1}'; echo 'not { json'"),
            |value| seen.push(value.clone()),
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.cancelled);
        assert_eq!(seen, vec![json!({"type": "x", "n": 1})]);
    }

    #[tokio::test]
    async fn strips_ansi_before_parsing() {
        let mut seen = Vec::new();
        run_json_lines(
            sh("printf '\\033[32m{\"ok\":true}\\033[0m\\n'"),
            |value| seen.push(value.clone()),
        )
        .await
        .unwrap();
        assert_eq!(seen, vec![json!({"ok": true})]);
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let opts = RunOptions {
            binary: "definitely-not-a-real-binary-ads".to_string(),
            ..Default::default()
        };
        let err = run_json_lines(opts, |_| {}).await.unwrap_err();
        assert!(matches!(err, RunnerError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn passes_stdin_to_child() {
        let mut seen = Vec::new();
        let mut opts = sh("read line; echo \"{\\\"echo\\\":\\\"$line\\\"}\"");
        opts.stdin_data = Some("hello\n".to_string());
        run_json_lines(opts, |value| seen.push(value.clone()))
            .await
            .unwrap();
        assert_eq!(seen, vec![json!({"echo": "hello"})]);
    }

    #[tokio::test]
    async fn cancel_terminates_within_grace() {
        let cancel = CancellationToken::new();
        let mut opts = sh("sleep 30");
        opts.cancel = cancel.clone();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = run_json_lines(opts, |_| {}).await.unwrap();
        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn capture_reports_timeout() {
        let outcome = run_capture(sh("sleep 5"), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn capture_collects_both_streams() {
        let outcome = run_capture(sh("echo out; echo err >&2"), None).await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn capture_survives_stderr_larger_than_pipe_buffer() {
        // seq writes well past the 64KB pipe buffer before stdout closes.
        let outcome = run_capture(
            sh("seq 1 20000 >&2; echo done"),
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
        assert_eq!(outcome.stdout.trim(), "done");
        assert!(outcome.stderr.len() > 64 * 1024);
    }
}
