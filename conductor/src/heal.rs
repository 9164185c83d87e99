//! Bounded build/test/fix iteration controller.
//!
//! Invoked by the pipeline engine's build stage. Each iteration runs the
//! agent with accumulated failure context, then the test command; the
//! loop always terminates: by test pass, by reaching the iteration
//! ceiling, or after a bounded number of auto-extend blocks granted only
//! when the agent reports meaningful forward progress.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::clock::Clock;
use crate::core::signature::failure_signature;
use crate::core::types::{Checkpoint, Event, Run};
use crate::intervention::InterventionBus;
use crate::io::agent::{AgentReport, AgentRequest, AgentRunner, invoke_and_load};
use crate::io::config::ConductorConfig;
use crate::io::memory::{FailureEntry, MemoryIndex};
use crate::io::paths::StatePaths;
use crate::io::state_store::StateStore;
use crate::io::test_command::{TestOutcome, TestRequest, TestRunner};

/// Bytes of failing test output carried into the next iteration's goal.
const FAILURE_EXCERPT_BYTES: usize = 2_000;

/// Failure signatures retained for repeat detection.
const SIGNATURE_HISTORY: usize = 8;

/// Why the heal loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealStop {
    /// Tests passed; the build stage is complete.
    Completed { iterations: u32 },
    /// Iteration budget (including any extensions) exhausted.
    Exhausted { iterations: u32, max_iterations: u32 },
    /// Abort requested; the engine finalizes the run.
    Aborted,
    /// Pause requested at an iteration boundary.
    Paused,
}

/// Shared collaborators for a heal invocation.
pub struct HealContext<'a, A: AgentRunner, T: TestRunner> {
    pub config: &'a ConductorConfig,
    pub paths: &'a StatePaths,
    pub store: &'a StateStore,
    pub memory: &'a MemoryIndex,
    pub intervention: &'a InterventionBus,
    pub agent: &'a A,
    pub tests: &'a T,
    pub clock: &'a dyn Clock,
}

/// Per-run inputs to the heal loop.
pub struct HealRequest {
    /// Build-stage objective text.
    pub instruction: String,
    /// The run's isolated worktree.
    pub workdir: PathBuf,
    /// Repository fingerprint for memory-index records.
    pub fingerprint: String,
    /// Pre-rendered memory context block (may be empty).
    pub memory_block: String,
}

/// Drive bounded build/test/fix iterations for a run.
///
/// Iterations are sequential within one run; `run.iteration_count` is
/// persisted in the checkpoint after every iteration so a crashed run
/// resumes with its budget already consumed.
#[instrument(skip_all, fields(run_id = %run.id, start_iter = run.iteration_count))]
pub fn run_heal<A: AgentRunner, T: TestRunner>(
    ctx: &HealContext<'_, A, T>,
    run: &mut Run,
    request: &HealRequest,
) -> Result<HealStop> {
    let mut history: VecDeque<String> = VecDeque::new();
    let mut last_failure: Option<String> = None;
    let mut change_approach = false;
    let mut repeat_count = 0u32;
    let mut effective_max = run.max_iterations;
    let mut blocks_used = 0u32;

    while run.iteration_count < effective_max {
        // Iteration boundaries are the checkpoint boundaries inside the
        // build stage: pause/abort take effect here, never mid-agent.
        if ctx.intervention.should_abort(&run.id)? {
            return Ok(HealStop::Aborted);
        }
        if ctx.intervention.is_paused(&run.id)? {
            return Ok(HealStop::Paused);
        }

        let iter = run.iteration_count + 1;
        let iter_dir = ctx.paths.run_logs_dir(&run.id).join(format!("build-{iter}"));
        let goal = render_heal_goal(
            run,
            request,
            iter,
            effective_max,
            last_failure.as_deref(),
            change_approach,
            repeat_count,
            ctx.config,
        )?;

        let agent_request = AgentRequest {
            workdir: request.workdir.clone(),
            goal,
            model: ctx.config.agent.model_for("build").to_string(),
            report_path: iter_dir.join("report.json"),
            log_path: iter_dir.join("agent.log"),
            timeout: Duration::from_secs(ctx.config.stage_timeout_secs),
            output_limit_bytes: ctx.config.output_limit_bytes,
        };

        // An agent timeout or crash is a transient failure for this
        // iteration, not an orchestrator error; the test command still
        // decides pass/fail.
        let report: Option<AgentReport> = match invoke_and_load(ctx.agent, &agent_request) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(iter, err = %err, "agent invocation failed this iteration");
                None
            }
        };

        run.iteration_count = iter;

        let use_full = request_full_tests(ctx.config, iter);
        let command = if use_full {
            ctx.config.tests.command.clone()
        } else {
            ctx.config
                .tests
                .subset_command
                .clone()
                .unwrap_or_else(|| ctx.config.tests.command.clone())
        };
        let outcome = ctx.tests.run(&TestRequest {
            workdir: request.workdir.clone(),
            command,
            log_path: iter_dir.join("tests.log"),
            timeout: Duration::from_secs(ctx.config.test_timeout_secs),
            output_limit_bytes: ctx.config.output_limit_bytes,
        })?;

        match outcome {
            TestOutcome::Pass => {
                if let (Some(signature), Some(report)) = (history.back(), report.as_ref()) {
                    // The fix that made tests pass resolves the latest
                    // remembered failure.
                    ctx.memory
                        .record_fix(&request.fingerprint, signature, &report.summary)?;
                }
                persist_iteration(ctx, run, iter, None, true)?;
                info!(iterations = run.iteration_count, "build healed");
                return Ok(HealStop::Completed {
                    iterations: run.iteration_count,
                });
            }
            TestOutcome::Fail { output } => {
                let signature = failure_signature(&output);
                ctx.memory.append_failure(
                    &request.fingerprint,
                    FailureEntry {
                        recorded_at: ctx.clock.now(),
                        signature: signature.clone(),
                        root_cause: first_line(&output),
                        fix: None,
                        affected_files: report
                            .as_ref()
                            .map(|r| r.affected_files.clone())
                            .unwrap_or_default(),
                    },
                )?;

                repeat_count = trailing_repeats(&history, &signature) + 1;
                change_approach = repeat_count >= ctx.config.signature_repeat_threshold;
                if history.len() == SIGNATURE_HISTORY {
                    history.pop_front();
                }
                history.push_back(signature.clone());
                last_failure = Some(tail_excerpt(&output, FAILURE_EXCERPT_BYTES));

                persist_iteration(ctx, run, iter, Some(&signature), false)?;

                if change_approach {
                    info!(repeat_count, "identical failure repeating, flagging approach change");
                }

                if run.iteration_count == effective_max
                    && ctx.config.auto_extend.enabled
                    && blocks_used < ctx.config.auto_extend.max_blocks
                    && report.as_ref().is_some_and(|r| r.forward_progress)
                {
                    blocks_used += 1;
                    effective_max += ctx.config.auto_extend.block_iterations;
                    ctx.store.append_event(
                        &Event::new("heal.extended", Some(&run.id), ctx.clock.now())
                            .with("block", blocks_used)
                            .with("new_max", effective_max),
                    )?;
                    info!(blocks_used, effective_max, "iteration budget extended");
                }
            }
        }
    }

    Ok(HealStop::Exhausted {
        iterations: run.iteration_count,
        max_iterations: effective_max,
    })
}

fn request_full_tests(config: &ConductorConfig, iter: u32) -> bool {
    config.tests.subset_command.is_none() || iter % config.full_test_every == 0
}

fn persist_iteration<A: AgentRunner, T: TestRunner>(
    ctx: &HealContext<'_, A, T>,
    run: &Run,
    iter: u32,
    signature: Option<&str>,
    passed: bool,
) -> Result<()> {
    let mut event = Event::new("heal.iteration", Some(&run.id), ctx.clock.now())
        .with("iteration", iter)
        .with("passed", passed);
    if let Some(signature) = signature {
        event = event.with("signature", signature);
    }
    ctx.store.append_event(&event)?;
    ctx.store
        .put(&StatePaths::checkpoint_key(&run.id), &checkpoint_for(run))?;
    ctx.store.put(&StatePaths::run_key(&run.id), run)?;
    Ok(())
}

/// Build a resume checkpoint from the run's current position.
pub fn checkpoint_for(run: &Run) -> Checkpoint {
    Checkpoint {
        run_id: run.id.clone(),
        current_stage: run.current_stage.clone(),
        stages_completed: run.stages_completed.clone(),
        iteration_count: run.iteration_count,
        worktree_path: run.worktree_path.clone(),
    }
}

fn trailing_repeats(history: &VecDeque<String>, signature: &str) -> u32 {
    history
        .iter()
        .rev()
        .take_while(|past| past.as_str() == signature)
        .count() as u32
}

fn first_line(output: &str) -> String {
    output
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("test failure")
        .trim()
        .to_string()
}

fn tail_excerpt(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}

#[allow(clippy::too_many_arguments)]
fn render_heal_goal(
    run: &Run,
    request: &HealRequest,
    iteration: u32,
    max_iterations: u32,
    failure: Option<&str>,
    change_approach: bool,
    repeat_count: u32,
    config: &ConductorConfig,
) -> Result<String> {
    use minijinja::{Environment, context};
    const HEAL_TEMPLATE: &str = include_str!("prompts/heal_goal.md");

    let mut env = Environment::new();
    env.add_template("heal", HEAL_TEMPLATE)
        .expect("heal template should be valid");
    let template = env.get_template("heal")?;
    let rendered = template.render(context! {
        run_id => run.id,
        title => run.title,
        iteration => iteration,
        max_iterations => max_iterations,
        instruction => request.instruction.trim(),
        test_command => config.tests.command.join(" "),
        failure => failure.map(str::trim).filter(|s| !s.is_empty()),
        change_approach => change_approach,
        repeat_count => repeat_count,
        memory => (!request.memory_block.trim().is_empty()).then(|| request.memory_block.trim()),
    })?;
    Ok(rendered)
}
