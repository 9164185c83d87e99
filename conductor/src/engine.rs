//! Pipeline stage state machine.
//!
//! Owns run records exclusively: creation (with the
//! at-most-one-active-run-per-item gate), stage transitions, checkpoint
//! and event emission, delegation to the self-heal loop for the build
//! stage, abort/pause handling at checkpoint boundaries, resume from
//! checkpoints, and side-effect-free dry-run estimation.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::{debug, info, instrument, warn};

use crate::core::clock::Clock;
use crate::core::signature::repo_fingerprint;
use crate::core::stats::{EstimateSource, StageEstimate};
use crate::core::types::{
    Checkpoint, Event, Run, RunStatus, STAGE_TEMPLATE, Stage, StageStatus, WorkItem,
};
use crate::heal::{HealContext, HealRequest, HealStop, checkpoint_for, run_heal};
use crate::intervention::InterventionBus;
use crate::io::agent::{AgentOutcome, AgentRequest, AgentRunner, invoke_and_load};
use crate::io::config::ConductorConfig;
use crate::io::ledger::CostLedger;
use crate::io::memory::MemoryIndex;
use crate::io::paths::StatePaths;
use crate::io::state_store::{NotFoundError, StateStore};
use crate::io::test_command::{TestOutcome, TestRequest, TestRunner};
use crate::io::worktree::WorktreeManager;

const STAGE_TEMPLATE_GOAL: &str = include_str!("prompts/stage_goal.md");

/// Admission found an existing non-terminal run for the same work item.
#[derive(Debug)]
pub struct DuplicateRunError {
    pub id: String,
}

impl fmt::Display for DuplicateRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work item {} already has a non-terminal run", self.id)
    }
}

impl std::error::Error for DuplicateRunError {}

/// A checkpoint could not be read or failed validation on resume.
#[derive(Debug)]
pub struct CorruptCheckpointError {
    pub run_id: String,
    pub reason: String,
}

impl fmt::Display for CorruptCheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt checkpoint for run {}: {}", self.run_id, self.reason)
    }
}

impl std::error::Error for CorruptCheckpointError {}

/// One row of the dry-run estimate table.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunRow {
    pub stage: String,
    pub model: String,
    pub skipped: bool,
    pub estimate: StageEstimate,
}

/// Full dry-run output: per-stage estimates, totals, budget remaining.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunTable {
    pub rows: Vec<DryRunRow>,
    pub total_duration_s: f64,
    pub total_cost_usd: f64,
    pub budget_remaining_usd: f64,
}

impl DryRunTable {
    /// Render the table deterministically for CLI output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<10} {:<10} {:>12} {:>10}  {}\n",
            "stage", "model", "duration_s", "cost_usd", "source"
        ));
        for row in &self.rows {
            if row.skipped {
                out.push_str(&format!("{:<10} {:<10} {:>12} {:>10}  skipped\n", row.stage, "-", "-", "-"));
                continue;
            }
            let source = match row.estimate.duration_source {
                EstimateSource::Measured => "measured",
                EstimateSource::Default => "no data",
            };
            out.push_str(&format!(
                "{:<10} {:<10} {:>12.1} {:>10.2}  {}\n",
                row.stage, row.model, row.estimate.duration_s, row.estimate.cost_usd, source
            ));
        }
        out.push_str(&format!(
            "{:<10} {:<10} {:>12.1} {:>10.2}\n",
            "total", "", self.total_duration_s, self.total_cost_usd
        ));
        out.push_str(&format!("budget remaining: ${:.2}\n", self.budget_remaining_usd));
        out
    }
}

enum StageOutcome {
    Completed,
    Failed { diagnostic: String },
    Aborted,
    Paused,
}

/// Stage state machine over the fixed template.
pub struct PipelineEngine<'a, A: AgentRunner, T: TestRunner> {
    pub config: &'a ConductorConfig,
    pub paths: &'a StatePaths,
    pub store: &'a StateStore,
    pub ledger: &'a CostLedger,
    pub memory: &'a MemoryIndex,
    pub worktrees: &'a WorktreeManager,
    pub intervention: &'a InterventionBus,
    pub agent: &'a A,
    pub tests: &'a T,
    pub clock: &'a dyn Clock,
}

impl<'a, A: AgentRunner, T: TestRunner> PipelineEngine<'a, A, T> {
    /// Repository fingerprint for memory-index records.
    pub fn fingerprint(&self) -> String {
        if self.config.repo.trim().is_empty() {
            repo_fingerprint(&self.paths.root.to_string_lossy())
        } else {
            repo_fingerprint(&self.config.repo)
        }
    }

    pub fn load_run(&self, run_id: &str) -> Result<Run> {
        self.store.get(&StatePaths::run_key(run_id))
    }

    /// Whether a non-terminal run exists for a work item.
    pub fn has_active_run(&self, id: &str) -> Result<bool> {
        match self.store.get::<Run>(&StatePaths::run_key(id)) {
            Ok(run) => Ok(!run.status.is_terminal()),
            Err(err) if err.downcast_ref::<NotFoundError>().is_some() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create a queued run for a work item.
    ///
    /// Admitting an item whose id already has a non-terminal run is
    /// rejected with [`DuplicateRunError`], never duplicated.
    #[instrument(skip_all, fields(item_id = %item.id))]
    pub fn create_run(&self, item: &WorkItem) -> Result<Run> {
        if self.has_active_run(&item.id)? {
            return Err(anyhow!(DuplicateRunError {
                id: item.id.clone()
            }));
        }
        let now = self.clock.now();
        let events = self.store.read_events()?;
        let estimate_cfg = self.config.estimate_config();
        let stages = STAGE_TEMPLATE
            .iter()
            .map(|stage| {
                let estimate = self.ledger.estimate(stage, &events, &estimate_cfg);
                let mut record = Stage::pending(stage, self.config.agent.model_for(stage));
                record.estimated_duration_s = Some(estimate.duration_s);
                record.estimated_cost_usd = Some(estimate.cost_usd);
                record
            })
            .collect();
        let run = Run {
            id: item.id.clone(),
            title: item.title.clone(),
            current_stage: STAGE_TEMPLATE[0].to_string(),
            stages,
            stages_completed: Vec::new(),
            status: RunStatus::Queued,
            started_at: now,
            iteration_count: 0,
            max_iterations: self.config.max_iterations,
            worktree_path: None,
            machine_id: None,
            cost_so_far_usd: 0.0,
        };
        self.persist(&run)?;
        self.checkpoint(&run)?;
        self.store.append_event(
            &Event::new("run.created", Some(&run.id), now)
                .with("title", &run.title)
                .with("triage_score", format!("{:.3}", item.triage_score)),
        )?;
        info!(run_id = %run.id, "run created");
        Ok(run)
    }

    /// Advance a run through the remaining template stages.
    ///
    /// Re-entering a stage recorded in `stages_completed` is a no-op, so
    /// resuming from any checkpoint between two completed stages yields
    /// the same `stages_completed` sequence as an uninterrupted run.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub fn execute(&self, run: &mut Run) -> Result<RunStatus> {
        run.status = RunStatus::Active;
        self.persist(run)?;
        self.store
            .append_event(&Event::new("run.started", Some(&run.id), self.clock.now()))?;

        // Worktree allocation failure is irrecoverable for the run:
        // surfaced immediately, no retry. A reassigned orphan may carry
        // a path that does not exist on this machine; reallocate then.
        let missing = run
            .worktree_path
            .as_ref()
            .is_none_or(|path| !std::path::Path::new(path).exists());
        if missing {
            match self.worktrees.allocate(&run.id) {
                Ok(path) => {
                    run.worktree_path = Some(path.to_string_lossy().into_owned());
                    self.persist(run)?;
                }
                Err(err) => {
                    return self.fail_run(run, "intake", &format!("worktree allocation failed: {err:#}"));
                }
            }
        }

        for stage in STAGE_TEMPLATE {
            if run.stages_completed.iter().any(|done| done == stage) {
                continue;
            }

            // Checkpoint boundary: pause/abort take effect here.
            if self.intervention.should_abort(&run.id)? {
                return self.finalize_abort(run);
            }
            if self.intervention.is_paused(&run.id)? {
                return self.pause_run(run);
            }

            run.current_stage = stage.to_string();

            if self.config.skip_stages.iter().any(|s| s == stage) {
                self.store.append_event(
                    &Event::new("stage.skipped", Some(&run.id), self.clock.now()).with("stage", stage),
                )?;
                run.stages_completed.push(stage.to_string());
                mark_stage(run, stage, StageStatus::Skipped, self.clock.now());
                self.checkpoint(run)?;
                self.persist(run)?;
                debug!(stage, "stage skipped");
                continue;
            }

            let started = self.clock.now();
            self.store.append_event(
                &Event::new("stage.started", Some(&run.id), started).with("stage", stage),
            )?;
            mark_stage(run, stage, StageStatus::Running, started);
            // Spend is attributed per stage from the estimate; no
            // per-stage cost telemetry exists from the agent itself.
            let events = self.store.read_events()?;
            let estimate = self
                .ledger
                .estimate(stage, &events, &self.config.estimate_config());
            run.cost_so_far_usd += estimate.cost_usd;
            self.checkpoint(run)?;

            let outcome = self.execute_stage(run, stage)?;
            match outcome {
                StageOutcome::Completed => {
                    let completed = self.clock.now();
                    let duration_s =
                        (completed - started).num_milliseconds() as f64 / 1000.0;
                    self.store.append_event(
                        &Event::new("stage.completed", Some(&run.id), completed)
                            .with("stage", stage)
                            .with("duration_s", format!("{duration_s:.3}")),
                    )?;
                    run.stages_completed.push(stage.to_string());
                    mark_stage(run, stage, StageStatus::Completed, completed);
                    self.checkpoint(run)?;
                    self.persist(run)?;
                    info!(stage, "stage completed");
                }
                StageOutcome::Failed { diagnostic } => {
                    return self.fail_run(run, stage, &diagnostic);
                }
                StageOutcome::Aborted => return self.finalize_abort(run),
                StageOutcome::Paused => return self.pause_run(run),
            }
        }

        run.status = RunStatus::Succeeded;
        let now = self.clock.now();
        self.store.append_event(
            &Event::new("pipeline.cost", Some(&run.id), now)
                .with("cost_usd", format!("{:.4}", run.cost_so_far_usd)),
        )?;
        self.store
            .append_event(&Event::new("run.succeeded", Some(&run.id), now))?;
        self.ledger.record(&run.id, run.cost_so_far_usd, now)?;
        self.persist(run)?;
        self.worktrees.release(&run.id)?;
        info!(cost_usd = run.cost_so_far_usd, "run succeeded");
        Ok(RunStatus::Succeeded)
    }

    fn execute_stage(&self, run: &mut Run, stage: &str) -> Result<StageOutcome> {
        match stage {
            "build" => self.execute_build_stage(run),
            "test" => self.execute_test_stage(run),
            _ => self.execute_agent_stage(run, stage),
        }
    }

    fn execute_agent_stage(&self, run: &mut Run, stage: &str) -> Result<StageOutcome> {
        let workdir = self.workdir(run)?;
        let goal = self.render_stage_goal(run, stage)?;
        let stage_dir = self.paths.run_logs_dir(&run.id).join(stage);
        let request = AgentRequest {
            workdir,
            goal,
            model: self.config.agent.model_for(stage).to_string(),
            report_path: stage_dir.join("report.json"),
            log_path: stage_dir.join("agent.log"),
            timeout: Duration::from_secs(self.config.stage_timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        match invoke_and_load(self.agent, &request) {
            Ok(report) => {
                self.write_artifact(&run.id, stage, &report.summary)?;
                match report.outcome {
                    AgentOutcome::Complete => Ok(StageOutcome::Completed),
                    AgentOutcome::Failed => Ok(StageOutcome::Failed {
                        diagnostic: report.summary,
                    }),
                }
            }
            Err(err) => Ok(StageOutcome::Failed {
                diagnostic: format!("{err:#}"),
            }),
        }
    }

    fn execute_test_stage(&self, run: &mut Run) -> Result<StageOutcome> {
        let workdir = self.workdir(run)?;
        let outcome = self.tests.run(&TestRequest {
            workdir,
            command: self.config.tests.command.clone(),
            log_path: self.paths.run_logs_dir(&run.id).join("test").join("tests.log"),
            timeout: Duration::from_secs(self.config.test_timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
        })?;
        match outcome {
            TestOutcome::Pass => Ok(StageOutcome::Completed),
            TestOutcome::Fail { output } => Ok(StageOutcome::Failed {
                diagnostic: format!(
                    "test stage failed: {}",
                    output.lines().find(|l| !l.trim().is_empty()).unwrap_or("no output")
                ),
            }),
        }
    }

    fn execute_build_stage(&self, run: &mut Run) -> Result<StageOutcome> {
        let workdir = self.workdir(run)?;
        let fingerprint = self.fingerprint();
        let memory_block = self.memory.context_block(&fingerprint, 5)?;
        let ctx = HealContext {
            config: self.config,
            paths: self.paths,
            store: self.store,
            memory: self.memory,
            intervention: self.intervention,
            agent: self.agent,
            tests: self.tests,
            clock: self.clock,
        };
        let request = HealRequest {
            instruction: stage_instruction("build").to_string(),
            workdir,
            fingerprint,
            memory_block,
        };
        match run_heal(&ctx, run, &request)? {
            HealStop::Completed { iterations } => {
                debug!(iterations, "build stage healed");
                Ok(StageOutcome::Completed)
            }
            HealStop::Exhausted {
                iterations,
                max_iterations,
            } => Ok(StageOutcome::Failed {
                diagnostic: format!(
                    "iteration budget exhausted ({iterations}/{max_iterations})"
                ),
            }),
            HealStop::Aborted => Ok(StageOutcome::Aborted),
            HealStop::Paused => Ok(StageOutcome::Paused),
        }
    }

    /// Resume a run from its checkpoint.
    ///
    /// A checkpoint that cannot be read or fails validation marks the
    /// run failed with a diagnostic event; it is never silently resumed
    /// from an assumed default.
    #[instrument(skip_all, fields(run_id))]
    pub fn resume(&self, run_id: &str) -> Result<Run> {
        let checkpoint: Checkpoint = match self.store.get(&StatePaths::checkpoint_key(run_id)) {
            Ok(cp) => cp,
            Err(err) if err.downcast_ref::<NotFoundError>().is_some() => {
                return Err(err.context(format!("no checkpoint for run {run_id}")));
            }
            Err(err) => {
                return self.reject_corrupt(run_id, &format!("{err:#}"));
            }
        };
        if let Err(reason) = checkpoint.validate() {
            return self.reject_corrupt(run_id, &reason);
        }

        let mut run = self.load_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        run.current_stage = checkpoint.current_stage;
        run.stages_completed = checkpoint.stages_completed;
        run.iteration_count = checkpoint.iteration_count;
        run.worktree_path = checkpoint.worktree_path;
        // The checkpoint is authoritative for position; reconcile any
        // stage record the crash left mid-transition.
        for name in run.stages_completed.clone() {
            if let Some(record) = run.stages.iter_mut().find(|s| s.name == name)
                && !matches!(record.status, StageStatus::Completed | StageStatus::Skipped)
            {
                record.status = StageStatus::Completed;
            }
        }
        run.status = RunStatus::Queued;
        self.persist(&run)?;
        info!(stage = %run.current_stage, "run rehydrated from checkpoint");
        Ok(run)
    }

    fn reject_corrupt(&self, run_id: &str, reason: &str) -> Result<Run> {
        warn!(run_id, reason, "corrupt checkpoint");
        if let Ok(mut run) = self.load_run(run_id) {
            run.status = RunStatus::Failed;
            self.persist(&run)?;
        }
        self.store.append_event(
            &Event::new("run.failed", Some(run_id), self.clock.now())
                .with("error", format!("corrupt checkpoint: {reason}")),
        )?;
        Err(anyhow!(CorruptCheckpointError {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
        }))
    }

    /// Compute the dry-run estimate table without executing anything.
    ///
    /// This is a pure read over the event history and budget state and
    /// produces identical output across repeated calls given the same
    /// history.
    pub fn dry_run(&self) -> Result<DryRunTable> {
        let events = self.store.read_events()?;
        let estimate_cfg = self.config.estimate_config();
        let mut rows = Vec::new();
        let mut total_duration_s = 0.0;
        let mut total_cost_usd = 0.0;
        for stage in STAGE_TEMPLATE {
            let skipped = self.config.skip_stages.iter().any(|s| s == stage);
            let estimate = self.ledger.estimate(stage, &events, &estimate_cfg);
            if !skipped {
                total_duration_s += estimate.duration_s;
                total_cost_usd += estimate.cost_usd;
            }
            rows.push(DryRunRow {
                stage: stage.to_string(),
                model: self.config.agent.model_for(stage).to_string(),
                skipped,
                estimate,
            });
        }
        let budget = self.ledger.summary(self.clock.now())?;
        Ok(DryRunTable {
            rows,
            total_duration_s,
            total_cost_usd,
            budget_remaining_usd: budget.remaining_usd,
        })
    }

    /// Record (or clear) a placement decision on the run.
    pub fn assign_machine(&self, run: &mut Run, machine: Option<&str>) -> Result<()> {
        run.machine_id = machine.map(str::to_string);
        self.persist(run)
    }

    /// Finalize an abort for a run that is not currently executing
    /// (e.g. the emergency brake engaged while the run sat queued).
    pub fn abort_run(&self, run_id: &str) -> Result<RunStatus> {
        let mut run = self.load_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        self.finalize_abort(&mut run)
    }

    fn fail_run(&self, run: &mut Run, stage: &str, diagnostic: &str) -> Result<RunStatus> {
        warn!(stage, diagnostic, "run failed");
        let now = self.clock.now();
        mark_stage(run, stage, StageStatus::Failed, now);
        self.store.append_event(
            &Event::new("stage.failed", Some(&run.id), now)
                .with("stage", stage)
                .with("error", diagnostic),
        )?;
        self.store.append_event(
            &Event::new("run.failed", Some(&run.id), now)
                .with("stage", stage)
                .with("error", diagnostic),
        )?;
        run.status = RunStatus::Failed;
        self.ledger.record(&run.id, run.cost_so_far_usd, now)?;
        self.persist(run)?;
        self.checkpoint(run)?;
        // The worktree is kept for post-mortem inspection on failure.
        Ok(RunStatus::Failed)
    }

    fn finalize_abort(&self, run: &mut Run) -> Result<RunStatus> {
        info!(run_id = %run.id, "aborting run");
        run.status = RunStatus::Aborted;
        // The final checkpoint and event are written before the
        // worktree is released.
        self.checkpoint(run)?;
        self.store.append_event(
            &Event::new("run.aborted", Some(&run.id), self.clock.now())
                .with("stage", &run.current_stage),
        )?;
        self.ledger
            .record(&run.id, run.cost_so_far_usd, self.clock.now())?;
        self.persist(run)?;
        self.worktrees.release(&run.id)?;
        self.intervention.acknowledge_abort(&run.id)?;
        Ok(RunStatus::Aborted)
    }

    fn pause_run(&self, run: &mut Run) -> Result<RunStatus> {
        info!(run_id = %run.id, stage = %run.current_stage, "run paused");
        run.status = RunStatus::Paused;
        self.checkpoint(run)?;
        self.store.append_event(
            &Event::new("run.paused", Some(&run.id), self.clock.now())
                .with("stage", &run.current_stage),
        )?;
        self.persist(run)?;
        Ok(RunStatus::Paused)
    }

    fn workdir(&self, run: &Run) -> Result<PathBuf> {
        let path = run
            .worktree_path
            .as_ref()
            .ok_or_else(|| anyhow!("run {} has no worktree", run.id))?;
        Ok(PathBuf::from(path))
    }

    fn persist(&self, run: &Run) -> Result<()> {
        self.store.put(&StatePaths::run_key(&run.id), run)
    }

    fn checkpoint(&self, run: &Run) -> Result<()> {
        self.store
            .put(&StatePaths::checkpoint_key(&run.id), &checkpoint_for(run))
    }

    fn write_artifact(&self, run_id: &str, stage: &str, summary: &str) -> Result<()> {
        let path = self
            .paths
            .run_logs_dir(run_id)
            .join(stage)
            .join("summary.md");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        fs::write(&path, summary).with_context(|| format!("write artifact {}", path.display()))
    }

    fn prior_artifacts(&self, run: &Run) -> String {
        let mut block = String::new();
        for stage in &run.stages_completed {
            let path = self
                .paths
                .run_logs_dir(&run.id)
                .join(stage)
                .join("summary.md");
            if let Ok(summary) = fs::read_to_string(&path) {
                let summary = summary.trim();
                if !summary.is_empty() {
                    block.push_str(&format!("### {stage}\n\n{summary}\n\n"));
                }
            }
        }
        block
    }

    fn render_stage_goal(&self, run: &Run, stage: &str) -> Result<String> {
        let fingerprint = self.fingerprint();
        let memory_block = self.memory.context_block(&fingerprint, 5)?;
        let artifacts = self.prior_artifacts(run);

        let mut env = Environment::new();
        env.add_template("stage", STAGE_TEMPLATE_GOAL)
            .expect("stage template should be valid");
        let template = env.get_template("stage")?;
        let rendered = template.render(context! {
            run_id => run.id,
            title => run.title,
            stage => stage,
            instruction => stage_instruction(stage),
            memory => (!memory_block.trim().is_empty()).then(|| memory_block.trim().to_string()),
            artifacts => (!artifacts.trim().is_empty()).then(|| artifacts.trim().to_string()),
        })?;
        Ok(rendered)
    }
}

/// Update a run's per-stage record for a status transition.
fn mark_stage(run: &mut Run, stage: &str, status: StageStatus, at: chrono::DateTime<chrono::Utc>) {
    if let Some(record) = run.stages.iter_mut().find(|s| s.name == stage) {
        record.status = status;
        match status {
            StageStatus::Running => record.started_at = Some(at),
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped => {
                record.completed_at = Some(at);
            }
            StageStatus::Pending => {}
        }
    }
}

/// Fixed objective text per template stage.
fn stage_instruction(stage: &str) -> &'static str {
    match stage {
        "intake" => {
            "Read the work item title and repository state, restate the requirement \
             in your own words, and note any constraint that will shape the work."
        }
        "triage" => {
            "Assess the scope of the change: which modules are involved, what could \
             break, and whether the work item needs to be narrowed."
        }
        "plan" => {
            "Produce a concrete, ordered plan of the code changes required, naming \
             the files to touch and the tests that will prove the behavior."
        }
        "design" => {
            "Settle the design decisions the plan left open: data shapes, interfaces \
             and error handling for the affected code paths."
        }
        "build" => {
            "Implement the planned change. Follow the plan and design summaries, keep \
             edits minimal, and make the test command pass."
        }
        "test" => "Run the full test suite and fix nothing; this stage only verifies.",
        "review" => {
            "Review the implemented change as a skeptical colleague: look for missed \
             edge cases, dead code and inconsistencies, and fix what you find."
        }
        "publish" => {
            "Prepare the change for publication: ensure the branch is coherent, \
             commit messages are clean, and summarize the change for the tracker."
        }
        _ => "Complete the stage objective for this pipeline.",
    }
}
