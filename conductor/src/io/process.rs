//! Bounded child-process execution with timeouts.

use std::io::{Read, Write as _};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a bounded child process.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the output limit (pipes stay drained).
    pub truncated_bytes: usize,
    pub timed_out: bool,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Combined stdout/stderr rendering for log files.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.truncated_bytes > 0 {
            buf.push_str(&format!("\n[{label} output truncated {} bytes]\n", self.truncated_bytes));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run a command with a timeout, capturing bounded stdout/stderr.
///
/// Output is drained concurrently while the child runs so large writes
/// never deadlock on a full pipe; bytes beyond `output_limit_bytes` are
/// counted and discarded. On timeout the child is killed and reaped.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_dropped) = join_drain(stdout_handle).context("join stdout reader")?;
    let (stderr, stderr_dropped) = join_drain(stderr_handle).context("join stderr reader")?;
    let truncated_bytes = stdout_dropped + stderr_dropped;
    if truncated_bytes > 0 {
        warn!(truncated_bytes, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
        truncated_bytes,
        timed_out,
    })
}

fn join_drain(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
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
            dropped += n.saturating_sub(keep);
        } else {
            dropped += n;
        }
    }

    Ok((buf, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf hello");
        let out = run_with_timeout(cmd, None, Duration::from_secs(5), 1024).expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn enforces_output_limit_while_draining() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("head -c 10000 /dev/zero");
        let out = run_with_timeout(cmd, None, Duration::from_secs(5), 100).expect("run");
        assert_eq!(out.stdout.len(), 100);
        assert_eq!(out.truncated_bytes, 9900);
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let out = run_with_timeout(cmd, None, Duration::from_millis(100), 1024).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn feeds_stdin() {
        let cmd = Command::new("cat");
        let out =
            run_with_timeout(cmd, Some(b"goal text"), Duration::from_secs(5), 1024).expect("run");
        assert_eq!(out.stdout, b"goal text");
    }
}
