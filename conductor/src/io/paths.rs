//! Canonical paths within `.conductor/` for an orchestrator root.

use std::path::PathBuf;

/// All durable state lives under `.conductor/` in the orchestrator root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_path: PathBuf,
    pub events_path: PathBuf,
    pub ledger_path: PathBuf,
    pub fleet_path: PathBuf,
    pub interventions_path: PathBuf,
    pub queue_path: PathBuf,
    pub daemon_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        let state_dir = conductor_dir.join("state");
        Self {
            root,
            state_dir: state_dir.clone(),
            runs_dir: state_dir.join("runs"),
            checkpoints_dir: state_dir.join("checkpoints"),
            memory_dir: conductor_dir.join("memory"),
            worktrees_dir: conductor_dir.join("worktrees"),
            logs_dir: conductor_dir.join("logs"),
            config_path: conductor_dir.join("config.toml"),
            events_path: state_dir.join("events.jsonl"),
            ledger_path: state_dir.join("ledger.json"),
            fleet_path: state_dir.join("fleet.json"),
            interventions_path: state_dir.join("interventions.json"),
            queue_path: conductor_dir.join("queue.json"),
            daemon_path: state_dir.join("daemon.json"),
            conductor_dir,
        }
    }

    /// Key for a run record in the state store.
    pub fn run_key(run_id: &str) -> String {
        format!("runs/{run_id}")
    }

    /// Key for a run checkpoint in the state store.
    pub fn checkpoint_key(run_id: &str) -> String {
        format!("checkpoints/{run_id}")
    }

    /// Per-run log directory (agent and test output).
    pub fn run_logs_dir(&self, run_id: &str) -> PathBuf {
        self.logs_dir.join(run_id)
    }
}
