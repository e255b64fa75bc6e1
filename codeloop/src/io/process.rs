//! Helpers for running child processes with timeouts, bounded output and
//! cancellation.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::{CancelToken, Interrupted, POLL_INTERVAL};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, with truncation notices, as one transcript.
    pub fn combined(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&stderr);
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }

    /// Fail with the command's stderr unless it exited successfully in time.
    pub fn ensure_success(&self, what: &str) -> Result<()> {
        if self.timed_out {
            return Err(anyhow!("{what} timed out"));
        }
        if !self.status.success() {
            return Err(anyhow!(
                "{what} failed with status {:?}: {}",
                self.status.code(),
                String::from_utf8_lossy(&self.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child is killed when `cancel` fires, and the call fails with [`Interrupted`].
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cancel.check()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
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

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        let slice = deadline
            .saturating_duration_since(Instant::now())
            .min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancelled, killing child process");
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
            return Err(Interrupted.into());
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = run_command(
            sh("echo hello; echo oops >&2"),
            Duration::from_secs(10),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.combined(), "hello\noops\n");
    }

    #[test]
    fn bounds_captured_output() {
        let out = run_command(
            sh("printf 'abcdefghij'"),
            Duration::from_secs(10),
            4,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(
            sh("exec sleep 5"),
            Duration::from_millis(200),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(out.ensure_success("sleep").is_err());
    }

    #[test]
    fn child_sees_closed_stdin() {
        let out = run_command(sh("cat"), Duration::from_secs(10), 1024, &CancelToken::new())
            .expect("run");
        assert!(out.status.success());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn cancelled_token_interrupts() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_command(sh("echo never"), Duration::from_secs(1), 1024, &cancel)
            .unwrap_err();
        assert!(err.downcast_ref::<Interrupted>().is_some());
    }
}
