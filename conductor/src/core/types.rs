//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between components. They must not
//! depend on external state or I/O and must serialize deterministically.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed pipeline stage template, in execution order.
///
/// Stage order is invariant per template and never mutated at runtime;
/// only stage statuses transition.
pub const STAGE_TEMPLATE: [&str; 8] = [
    "intake", "triage", "plan", "design", "build", "test", "review", "publish",
];

/// Position of a stage name within the template, if present.
pub fn stage_index(name: &str) -> Option<usize> {
    STAGE_TEMPLATE.iter().position(|stage| *stage == name)
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Active,
    Paused,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One named step of the pipeline template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved per-stage execution profile (agent model identifier).
    pub model: String,
    pub estimated_duration_s: Option<f64>,
    pub estimated_cost_usd: Option<f64>,
}

impl Stage {
    pub fn pending(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            model: model.to_string(),
            estimated_duration_s: None,
            estimated_cost_usd: None,
        }
    }
}

/// One pipeline execution for one work item.
///
/// Owned exclusively by the pipeline engine; the daemon and fleet
/// coordinator reference runs by `id` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Work-item identifier (e.g. issue number).
    pub id: String,
    pub title: String,
    pub current_stage: String,
    /// Per-stage records in template order; statuses transition, the
    /// order never does.
    pub stages: Vec<Stage>,
    /// Ordered names of stages that reached `completed` or `skipped`.
    pub stages_completed: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Self-heal iterations consumed by the build stage so far.
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub worktree_path: Option<String>,
    pub machine_id: Option<String>,
    pub cost_so_far_usd: f64,
}

/// Immutable append-only fact about a state transition.
///
/// Events are the sole source of historical statistics and are never
/// rewritten, only appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: Option<String>,
    /// Free-form payload; BTreeMap keeps serialized key order stable.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: &str, run_id: Option<&str>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            event_type: event_type.to_string(),
            run_id: run_id.map(str::to_string),
            payload: BTreeMap::new(),
        }
    }

    /// Attach a payload entry, consuming and returning the event.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.payload.insert(key.to_string(), value.to_string());
        self
    }
}

/// Serialized snapshot of a run sufficient to resume it after a crash.
///
/// Written atomically after every stage transition and every self-heal
/// iteration. Re-entering a stage recorded in `stages_completed` must be
/// a no-op on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub current_stage: String,
    pub stages_completed: Vec<String>,
    pub iteration_count: u32,
    pub worktree_path: Option<String>,
}

impl Checkpoint {
    /// Validate internal consistency against the stage template.
    ///
    /// A checkpoint that names unknown stages or lists completions out of
    /// template order cannot be resumed and must fail the run.
    pub fn validate(&self) -> Result<(), String> {
        if self.run_id.trim().is_empty() {
            return Err("checkpoint missing run id".to_string());
        }
        let current = stage_index(&self.current_stage)
            .ok_or_else(|| format!("unknown stage {:?}", self.current_stage))?;
        let mut prev = None;
        for name in &self.stages_completed {
            let idx = stage_index(name).ok_or_else(|| format!("unknown stage {name:?}"))?;
            if let Some(prev_idx) = prev
                && idx <= prev_idx
            {
                return Err(format!("stages_completed out of template order at {name:?}"));
            }
            if idx > current {
                return Err(format!(
                    "completed stage {name:?} is after current stage {:?}",
                    self.current_stage
                ));
            }
            prev = Some(idx);
        }
        Ok(())
    }
}

/// Role a machine plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    Worker,
    Leader,
}

/// Liveness status derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Degraded,
    Offline,
}

/// A fleet member, created by a join and mutated by heartbeat receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineNode {
    pub name: String,
    pub host: String,
    pub role: MachineRole,
    pub max_workers: u32,
    pub active_workers: u32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: MachineStatus,
}

/// Per-factor inputs to the triage score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoringFactors {
    pub complexity: f64,
    pub impact: f64,
    pub priority: f64,
    pub age: f64,
    pub dependency_pressure: f64,
    pub memory_signal: f64,
}

/// A candidate pending admission. Transient: discarded once a run is
/// created or the item is deferred to the next poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub factors: ScoringFactors,
    #[serde(default)]
    pub triage_score: f64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
}
