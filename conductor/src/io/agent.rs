//! Agent executor seam.
//!
//! The [`AgentRunner`] trait decouples stage orchestration from the
//! coding-agent backend. The core treats the agent as opaque: it consumes
//! a goal string and either signals completion, fails, or times out.
//! Tests use scripted runners that return predetermined reports without
//! spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_with_timeout;

const REPORT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/agent_report.schema.json"
));

/// Sentinel outcome declared by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentOutcome {
    Complete,
    Failed,
}

/// Structured report the agent must write when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub outcome: AgentOutcome,
    pub summary: String,
    /// Set when the agent believes it made meaningful forward progress
    /// despite not completing; feeds the self-heal auto-extend policy.
    #[serde(default)]
    pub forward_progress: bool,
    #[serde(default)]
    pub affected_files: Vec<String>,
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory (the run's worktree).
    pub workdir: PathBuf,
    /// Assembled goal text fed to the agent.
    pub goal: String,
    /// Resolved per-stage model identifier.
    pub model: String,
    /// Path where the agent must write its report JSON.
    pub report_path: PathBuf,
    /// Path to write the agent stdout/stderr log.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over coding-agent backends.
pub trait AgentRunner {
    /// Run the agent. Must write a report to `request.report_path` on a
    /// successful exit.
    fn invoke(&self, request: &AgentRequest) -> Result<()>;
}

/// Runner that spawns the configured agent CLI as a subprocess.
///
/// The goal is fed on stdin; the agent is told where to write its
/// report. Everything else about the agent is opaque to the core.
pub struct SubprocessAgent {
    program: String,
}

impl SubprocessAgent {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AgentRunner for SubprocessAgent {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting agent");
        if let Some(parent) = request.report_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create report dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.arg("exec")
            .arg("--model")
            .arg(&request.model)
            .arg("--report")
            .arg(&request.report_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_with_timeout(
            cmd,
            Some(request.goal.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run agent")?;

        write_agent_log(&request.log_path, &output.render_log("agent"))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {:?}",
                output.status.code()
            ));
        }
        debug!("agent completed");
        Ok(())
    }
}

/// Invoke the agent and load its validated report.
#[instrument(skip_all, fields(report_path = %request.report_path.display()))]
pub fn invoke_and_load<A: AgentRunner>(agent: &A, request: &AgentRequest) -> Result<AgentReport> {
    agent.invoke(request)?;
    let report = load_report(&request.report_path)?;
    debug!(outcome = ?report.outcome, "agent report loaded");
    Ok(report)
}

/// Read and schema-validate an agent report file.
pub fn load_report(path: &Path) -> Result<AgentReport> {
    if !path.exists() {
        return Err(anyhow!("missing agent report {}", path.display()));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read agent report {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse agent report {}", path.display()))?;
    validate_report_schema(&value)?;
    serde_json::from_value(value).with_context(|| format!("decode agent report {}", path.display()))
}

/// Validate a report against the bundled schema (Draft 2020-12).
fn validate_report_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(REPORT_SCHEMA).context("parse bundled schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile report schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "agent report schema violations:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

fn write_agent_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAgent {
        report: Option<String>,
    }

    impl AgentRunner for FakeAgent {
        fn invoke(&self, request: &AgentRequest) -> Result<()> {
            if let Some(report) = &self.report {
                fs::write(&request.report_path, report)?;
            }
            Ok(())
        }
    }

    fn request(temp: &tempfile::TempDir) -> AgentRequest {
        AgentRequest {
            workdir: temp.path().to_path_buf(),
            goal: "goal".to_string(),
            model: "default".to_string(),
            report_path: temp.path().join("report.json"),
            log_path: temp.path().join("agent.log"),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1000,
        }
    }

    #[test]
    fn loads_valid_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = FakeAgent {
            report: Some(
                r#"{"outcome":"complete","summary":"done","forward_progress":false}"#.to_string(),
            ),
        };
        let report = invoke_and_load(&agent, &request(&temp)).expect("load");
        assert_eq!(report.outcome, AgentOutcome::Complete);
        assert_eq!(report.summary, "done");
    }

    #[test]
    fn missing_report_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = FakeAgent { report: None };
        let err = invoke_and_load(&agent, &request(&temp)).unwrap_err();
        assert!(err.to_string().contains("missing agent report"));
    }

    #[test]
    fn schema_rejects_unknown_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = FakeAgent {
            report: Some(r#"{"outcome":"maybe","summary":"hm"}"#.to_string()),
        };
        let err = invoke_and_load(&agent, &request(&temp)).unwrap_err();
        assert!(err.to_string().contains("schema violations"));
    }

    #[test]
    fn schema_rejects_empty_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = FakeAgent {
            report: Some(r#"{"outcome":"failed","summary":""}"#.to_string()),
        };
        assert!(invoke_and_load(&agent, &request(&temp)).is_err());
    }
}
