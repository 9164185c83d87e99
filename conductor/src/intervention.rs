//! Cross-cutting intervention flags: pause/resume/abort/emergency brake.
//!
//! Flags are file-backed so a CLI invocation can signal a running
//! daemon. Pause and resume only take effect at checkpoint boundaries
//! (never mid-agent-invocation); abort may interrupt an in-flight agent
//! but the engine still writes a final checkpoint and event before
//! releasing the worktree.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::io::state_store::write_atomic;

/// Persisted intervention flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionState {
    #[serde(default)]
    pub paused_runs: BTreeSet<String>,
    #[serde(default)]
    pub abort_runs: BTreeSet<String>,
    /// Aborts all active runs and pauses the admission loop.
    #[serde(default)]
    pub emergency_brake: bool,
    #[serde(default)]
    pub daemon_paused: bool,
    /// Orderly daemon shutdown at the next cycle boundary.
    #[serde(default)]
    pub daemon_stop: bool,
}

/// File-backed intervention bus observed by the daemon, the pipeline
/// engine and the fleet coordinator.
#[derive(Debug, Clone)]
pub struct InterventionBus {
    path: PathBuf,
}

impl InterventionBus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<InterventionState> {
        if !self.path.exists() {
            return Ok(InterventionState::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read interventions {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse interventions {}", self.path.display()))
    }

    pub fn pause(&self, run_id: &str) -> Result<()> {
        self.update(|state| {
            state.paused_runs.insert(run_id.to_string());
        })
    }

    pub fn resume(&self, run_id: &str) -> Result<()> {
        self.update(|state| {
            state.paused_runs.remove(run_id);
        })
    }

    pub fn abort(&self, run_id: &str) -> Result<()> {
        self.update(|state| {
            state.abort_runs.insert(run_id.to_string());
            state.paused_runs.remove(run_id);
        })
    }

    /// Clear an abort flag once the run has been finalized.
    pub fn acknowledge_abort(&self, run_id: &str) -> Result<()> {
        self.update(|state| {
            state.abort_runs.remove(run_id);
        })
    }

    pub fn emergency_brake(&self) -> Result<()> {
        info!("emergency brake engaged");
        self.update(|state| {
            state.emergency_brake = true;
            state.daemon_paused = true;
        })
    }

    pub fn pause_daemon(&self) -> Result<()> {
        self.update(|state| {
            state.daemon_paused = true;
        })
    }

    /// Resume admission; also releases an engaged emergency brake.
    pub fn resume_daemon(&self) -> Result<()> {
        self.update(|state| {
            state.daemon_paused = false;
            state.emergency_brake = false;
        })
    }

    pub fn stop_daemon(&self) -> Result<()> {
        self.update(|state| {
            state.daemon_stop = true;
        })
    }

    /// Clear the stop flag on daemon startup so a stale request from a
    /// previous process does not immediately stop the new one.
    pub fn clear_stop(&self) -> Result<()> {
        self.update(|state| {
            state.daemon_stop = false;
        })
    }

    pub fn is_paused(&self, run_id: &str) -> Result<bool> {
        Ok(self.load()?.paused_runs.contains(run_id))
    }

    /// Abort requested for this run, individually or via the brake.
    pub fn should_abort(&self, run_id: &str) -> Result<bool> {
        let state = self.load()?;
        Ok(state.emergency_brake || state.abort_runs.contains(run_id))
    }

    fn update(&self, mutate: impl FnOnce(&mut InterventionState)) -> Result<()> {
        let mut state = self.load()?;
        mutate(&mut state);
        let mut buf = serde_json::to_string_pretty(&state).context("serialize interventions")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}
