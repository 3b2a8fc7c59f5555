//! Subprocess execution for the Git binaries and the recipe evaluator.
//!
//! Two modes. Batched: feed stdin, collect stdout/stderr, wait for exit,
//! with an optional wall-clock deadline that kills the child on expiry.
//! Streaming: spawn and hand back live stdout for attachment to an HTTP
//! response body while stderr drains to the log and the child is reaped in
//! the background.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Collected result of a batched subprocess run.
#[derive(Debug)]
pub struct CommandOutput {
    /// True when the child exited with status 0 before any deadline.
    pub ok: bool,
    /// Exit code, absent when the child was killed by a signal or deadline.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Stderr as lossy UTF-8, trimmed, for log and error messages.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

// ---------------------------------------------------------------------------
// Batched mode
// ---------------------------------------------------------------------------

/// Run `program` with `args`, optionally writing `stdin_data` to its stdin,
/// and collect the full output.
///
/// When `timeout` is set and expires, the child receives SIGKILL and the
/// call returns a failed [`CommandOutput`] rather than an error: a deadline
/// is an expected outcome, not a spawn problem.
#[instrument(skip(stdin_data, args), fields(%program))]
pub async fn run_batched(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    stdin_data: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(if stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdin_pipe = child.stdin.take();
    let drive = async {
        // Stdin is fed while stdout drains; feeding first can deadlock on
        // full pipes when the child starts writing before EOF.
        let feed = async {
            if let (Some(mut stdin), Some(data)) = (stdin_pipe, stdin_data) {
                // A child that exits early closes the pipe; that shows up
                // in the exit status, not here.
                let _ = stdin.write_all(data).await;
                let _ = stdin.shutdown().await;
            }
        };
        let (_, collected) = tokio::join!(feed, collect_output(&mut child));
        collected
    };

    // The drive future borrows the child; settle it into a plain value
    // before the timeout branch needs the child back for the kill.
    let outcome = match timeout {
        Some(deadline) => tokio::time::timeout(deadline, drive).await,
        None => Ok(drive.await),
    };

    match outcome {
        Ok(collected) => collected,
        Err(_) => {
            warn!(%program, ?timeout, "subprocess deadline expired; killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(CommandOutput {
                ok: false,
                exit_code: None,
                stdout: Vec::new(),
                stderr: format!("{program} timed out").into_bytes(),
            })
        }
    }
}

async fn collect_output(child: &mut tokio::process::Child) -> Result<CommandOutput> {
    let mut stdout_pipe = child
        .stdout
        .take()
        .context("child stdout was not captured")?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .context("child stderr was not captured")?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let (status, _, _) = tokio::try_join!(
        async {
            child
                .wait()
                .await
                .map_err(|e| anyhow::anyhow!("failed to wait on child: {e}"))
        },
        async {
            stdout_pipe
                .read_to_end(&mut stdout)
                .await
                .map_err(|e| anyhow::anyhow!("failed to read child stdout: {e}"))
        },
        async {
            stderr_pipe
                .read_to_end(&mut stderr)
                .await
                .map_err(|e| anyhow::anyhow!("failed to read child stderr: {e}"))
        },
    )?;

    debug!(?status, stdout_len = stdout.len(), "subprocess finished");

    Ok(CommandOutput {
        ok: status.success(),
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

// ---------------------------------------------------------------------------
// Streaming mode
// ---------------------------------------------------------------------------

/// Spawn `program` and return its live stdout.
///
/// Nothing is written to stdin. Stderr lines are logged at debug level and
/// the child is reaped by a background task; a non-zero exit is logged but
/// cannot be reported to the caller, which has typically already streamed
/// the output onward.
#[instrument(skip(args), fields(%program))]
pub fn spawn_streaming(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<ChildStdout> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("failed to capture {program} stdout"))?;

    if let Some(stderr) = child.stderr.take() {
        let program = program.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%program, line, "subprocess stderr");
            }
        });
    }

    let program = program.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%program, %status, "streaming subprocess exited with non-zero status");
            }
            Err(e) => {
                warn!(%program, error = %e, "failed to wait on streaming subprocess");
            }
            _ => {}
        }
    });

    Ok(stdout)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batched_captures_stdout_and_exit() {
        let out = run_batched("sh", &["-c", "printf hello"], None, None, None)
            .await
            .unwrap();
        assert!(out.ok);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, b"hello");
    }

    #[tokio::test]
    async fn batched_reports_failure_exit() {
        let out = run_batched("sh", &["-c", "echo oops >&2; exit 3"], None, None, None)
            .await
            .unwrap();
        assert!(!out.ok);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr_text(), "oops");
    }

    #[tokio::test]
    async fn batched_feeds_stdin() {
        let out = run_batched("cat", &[], None, Some(b"piped"), None)
            .await
            .unwrap();
        assert!(out.ok);
        assert_eq!(out.stdout, b"piped");
    }

    #[tokio::test]
    async fn batched_timeout_kills_child() {
        let started = std::time::Instant::now();
        let out = run_batched(
            "sleep",
            &["30"],
            None,
            None,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(!out.ok);
        assert_eq!(out.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn batched_honours_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let out = run_batched("pwd", &[], Some(tmp.path()), None, None)
            .await
            .unwrap();
        let printed = String::from_utf8_lossy(&out.stdout);
        let canonical = tmp.path().canonicalize().unwrap();
        assert_eq!(printed.trim(), canonical.to_string_lossy());
    }

    #[tokio::test]
    async fn streaming_yields_stdout() {
        let mut stdout = spawn_streaming("sh", &["-c", "printf streamed"], None).unwrap();
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"streamed");
    }
}
