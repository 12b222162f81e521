//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// How often a wait checks the cancel signal.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The child was killed because the cancel signal fired.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    /// Stdout as text, with a notice appended when bytes were dropped.
    pub fn stdout_text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        text
    }

    /// Stderr as text, with a notice appended when bytes were dropped.
    pub fn stderr_text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// When `cancel` fires the child is killed and the output is marked `cancelled`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    let started = Instant::now();
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Fed from its own thread so a child that never reads cannot stall the timeout.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child closed stdin early");
            }
        });
    }

    let (status, timed_out, cancelled) = wait_child(&mut child, timeout, cancel)?;

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed: started.elapsed(),
    })
}

/// Wait for `child` in short slices so a cancel signal is noticed promptly.
fn wait_child(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, bool, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            return Ok((kill_and_wait(child)?, true, false));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing");
            return Ok((kill_and_wait(child)?, false, true));
        }
        let slice = match cancel {
            Some(_) => remaining.min(CANCEL_POLL),
            None => remaining,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, false, false));
        }
    }
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn sleep(secs: &str) -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg(secs);
        cmd
    }

    #[test]
    fn captures_output_and_status() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1_000,
            None,
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert!(!output.success());
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let output = run_command_with_timeout(
            sh("printf '0123456789'"),
            None,
            Duration::from_secs(10),
            4,
            None,
        )
        .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text("tool").contains("truncated 6 bytes"));
    }

    #[test]
    fn stdin_is_forwarded() {
        let output = run_command_with_timeout(
            sh("cat"),
            Some(b"prompt text"),
            Duration::from_secs(10),
            1_000,
            None,
        )
        .expect("run");
        assert_eq!(output.stdout, b"prompt text");
    }

    #[test]
    fn slow_command_times_out() {
        let output = run_command_with_timeout(
            sleep("5"),
            None,
            Duration::from_millis(200),
            1_000,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(output.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn cancel_kills_the_child() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel("stop");
        });
        let output = run_command_with_timeout(
            sleep("5"),
            None,
            Duration::from_secs(30),
            1_000,
            Some(&token),
        )
        .expect("run");
        canceller.join().expect("join");
        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(output.elapsed < Duration::from_secs(5));
    }
}
