//! Test-command runner adapter for the self-heal loop and test stage.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::run_with_timeout;

/// Pass/fail outcome of a test command, with the captured output that
/// feeds failure signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Pass,
    /// Combined output of the failing command (bounded).
    Fail { output: String },
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Pass)
    }
}

/// Parameters for one test-command invocation.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    /// Command argv; the first element is the program.
    pub command: Vec<String>,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over test execution so the heal loop is scriptable in
/// tests.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome>;
}

/// Runner that executes the configured command as a subprocess.
///
/// A timeout counts as a failure, not an orchestrator error: a hung
/// test suite is something the next heal iteration should try to fix.
pub struct CommandTestRunner;

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        let program = request
            .command
            .first()
            .ok_or_else(|| anyhow!("test command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(&request.command[1..]).current_dir(&request.workdir);

        let output = run_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .context("run test command")?;
        let log = output.render_log("tests");
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create test log dir {}", parent.display()))?;
        }
        fs::write(&request.log_path, &log)
            .with_context(|| format!("write test log {}", request.log_path.display()))?;

        if output.success() {
            debug!("tests passed");
            Ok(TestOutcome::Pass)
        } else {
            debug!(timed_out = output.timed_out, "tests failed");
            Ok(TestOutcome::Fail { output: log })
        }
    }
}
