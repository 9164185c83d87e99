//! Isolated per-run filesystem workspaces via `git worktree`.
//!
//! Each run gets its own worktree so a re-invoked agent (at-least-once
//! delivery after orphan reconciliation) only ever sees its own
//! partially-modified state. We keep a small, explicit wrapper around
//! `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Allocates and releases per-run worktrees under a base directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktrees_dir: worktrees_dir.into(),
        }
    }

    /// Path a run's worktree lives at, allocated or not.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.worktrees_dir.join(run_id)
    }

    /// Allocate an isolated worktree for a run on a dedicated branch.
    ///
    /// Re-allocation for an existing worktree returns the existing path
    /// so resume after a crash is idempotent. Failure here is
    /// irrecoverable for the run (no retry).
    #[instrument(skip_all, fields(run_id))]
    pub fn allocate(&self, run_id: &str) -> Result<PathBuf> {
        let path = self.path_for(run_id);
        if path.exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(path);
        }
        std::fs::create_dir_all(&self.worktrees_dir).with_context(|| {
            format!("create worktrees dir {}", self.worktrees_dir.display())
        })?;
        let branch = format!("conductor/run-{run_id}");
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 worktree path {}", path.display()))?;
        self.run_checked(&["worktree", "add", "-B", &branch, path_str])
            .with_context(|| format!("allocate worktree for run {run_id}"))?;
        debug!(path = %path.display(), branch, "worktree allocated");
        Ok(path)
    }

    /// Release a run's worktree and prune bookkeeping.
    ///
    /// Missing worktrees are not an error: release runs in abort paths
    /// where allocation may never have happened.
    #[instrument(skip_all, fields(run_id))]
    pub fn release(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(());
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 worktree path {}", path.display()))?;
        if let Err(err) = self.run_checked(&["worktree", "remove", "--force", path_str]) {
            // A worktree with stray lock files can refuse removal; fall
            // back to deleting the directory and pruning metadata.
            warn!(err = %err, "git worktree remove failed, pruning manually");
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("remove worktree dir {}", path.display()))?;
            if let Err(err) = self.run_checked(&["worktree", "prune"]) {
                warn!(err = %err, "git worktree prune failed");
            }
        }
        Ok(())
    }

    /// List worktree paths currently registered with git.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        let mut paths = Vec::new();
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                paths.push(PathBuf::from(path));
            }
        }
        Ok(paths)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("run git {args:?}"))
    }

    fn run_checked(&self, args: &[&str]) -> Result<()> {
        let out = self.run(args)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "git {args:?} failed with status {:?}: {}",
                out.status.code(),
                stderr.trim()
            ));
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let out = self.run(args)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "git {args:?} failed with status {:?}: {}",
                out.status.code(),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}
