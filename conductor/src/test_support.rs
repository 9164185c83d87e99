//! Test-only fixtures: scripted agents/test runners, a manual clock and
//! a preassembled orchestrator harness over a temp directory.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};

use crate::core::clock::Clock;
use crate::core::types::{ScoringFactors, WorkItem};
use crate::daemon::WorkSource;
use crate::engine::PipelineEngine;
use crate::intervention::InterventionBus;
use crate::io::agent::{AgentOutcome, AgentReport, AgentRequest, AgentRunner};
use crate::io::config::ConductorConfig;
use crate::io::ledger::CostLedger;
use crate::io::memory::MemoryIndex;
use crate::io::paths::StatePaths;
use crate::io::state_store::StateStore;
use crate::io::test_command::{TestOutcome, TestRequest, TestRunner};
use crate::io::worktree::WorktreeManager;

/// Deterministic work item for tests.
pub fn item(id: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        title: format!("{id} title"),
        labels: Vec::new(),
        factors: ScoringFactors {
            priority: 1.0,
            ..ScoringFactors::default()
        },
        triage_score: 0.0,
        estimated_cost_usd: 0.0,
    }
}

/// Clock advanced explicitly by tests; `sleep` advances instead of
/// blocking.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::from_std(duration).expect("duration");
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Report(AgentReport),
    Error(String),
}

/// Agent fake: replays a script, repeating the last step when exhausted,
/// and records every goal it was given.
pub struct ScriptedAgent {
    script: Vec<ScriptedStep>,
    calls: AtomicUsize,
    pub goals: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn from_script(script: Vec<ScriptedStep>) -> Self {
        assert!(!script.is_empty(), "script must not be empty");
        Self {
            script,
            calls: AtomicUsize::new(0),
            goals: Mutex::new(Vec::new()),
        }
    }

    /// Every invocation completes successfully.
    pub fn always_complete() -> Self {
        Self::from_script(vec![ScriptedStep::Report(complete_report("stage complete"))])
    }

    /// The nth invocation (1-based) reports failure; others complete.
    pub fn fail_at_stage(n: usize) -> Self {
        let mut script = Vec::new();
        for i in 1..=n {
            if i == n {
                script.push(ScriptedStep::Report(failed_report("scripted failure")));
            } else {
                script.push(ScriptedStep::Report(complete_report("stage complete")));
            }
        }
        // Later invocations complete again.
        script.push(ScriptedStep::Report(complete_report("stage complete")));
        Self::from_script(script)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn complete_report(summary: &str) -> AgentReport {
    AgentReport {
        outcome: AgentOutcome::Complete,
        summary: summary.to_string(),
        forward_progress: false,
        affected_files: Vec::new(),
    }
}

pub fn failed_report(summary: &str) -> AgentReport {
    AgentReport {
        outcome: AgentOutcome::Failed,
        summary: summary.to_string(),
        forward_progress: false,
        affected_files: Vec::new(),
    }
}

impl AgentRunner for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        self.goals
            .lock()
            .expect("goals lock")
            .push(request.goal.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .get(call)
            .unwrap_or_else(|| self.script.last().expect("non-empty script"));
        match step {
            ScriptedStep::Report(report) => {
                if let Some(parent) = request.report_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut buf = serde_json::to_string_pretty(report)?;
                buf.push('\n');
                std::fs::write(&request.report_path, buf)?;
                Ok(())
            }
            ScriptedStep::Error(message) => Err(anyhow!(message.clone())),
        }
    }
}

/// Test-runner fake: replays outcomes, repeating the last when
/// exhausted.
pub struct ScriptedTests {
    outcomes: Vec<TestOutcome>,
    calls: AtomicUsize,
}

impl ScriptedTests {
    pub fn from_outcomes(outcomes: Vec<TestOutcome>) -> Self {
        assert!(!outcomes.is_empty(), "outcomes must not be empty");
        Self {
            outcomes,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_pass() -> Self {
        Self::from_outcomes(vec![TestOutcome::Pass])
    }

    /// Fail `n` times with the given output, then pass.
    pub fn fail_times(n: usize, output: &str) -> Self {
        let mut outcomes = Vec::new();
        for _ in 0..n {
            outcomes.push(TestOutcome::Fail {
                output: output.to_string(),
            });
        }
        outcomes.push(TestOutcome::Pass);
        Self::from_outcomes(outcomes)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TestRunner for ScriptedTests {
    fn run(&self, _request: &TestRequest) -> Result<TestOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .outcomes
            .get(call)
            .unwrap_or_else(|| self.outcomes.last().expect("non-empty outcomes"))
            .clone())
    }
}

/// In-memory work source for daemon tests.
pub struct StaticWorkSource {
    items: Mutex<Vec<WorkItem>>,
}

impl StaticWorkSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }
}

impl WorkSource for StaticWorkSource {
    fn fetch(&self) -> Result<Vec<WorkItem>> {
        Ok(self.items.lock().expect("items lock").clone())
    }

    fn acknowledge(&self, id: &str) -> Result<()> {
        self.items
            .lock()
            .expect("items lock")
            .retain(|item| item.id != id);
        Ok(())
    }
}

/// Preassembled orchestrator state over a temp directory.
pub struct Harness {
    pub config: ConductorConfig,
    pub paths: StatePaths,
    pub store: StateStore,
    pub ledger: CostLedger,
    pub memory: MemoryIndex,
    pub worktrees: WorktreeManager,
    pub intervention: InterventionBus,
    pub clock: ManualClock,
    temp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ConductorConfig::default())
    }

    pub fn with_config(config: ConductorConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        init_git_repo(temp.path());
        let paths = StatePaths::new(temp.path());
        let store = StateStore::new(&paths.state_dir, &paths.events_path);
        let clock = ManualClock::default();
        let ledger = CostLedger::open(&paths.ledger_path, config.daily_budget_usd, clock.now())
            .expect("open ledger");
        let memory = MemoryIndex::new(&paths.memory_dir);
        let worktrees = WorktreeManager::new(&paths.root, &paths.worktrees_dir);
        let intervention = InterventionBus::new(&paths.interventions_path);
        Self {
            config,
            paths,
            store,
            ledger,
            memory,
            worktrees,
            intervention,
            clock,
            temp,
        }
    }

    /// Engine over this harness's state with the given fakes.
    pub fn engine<'a, A: AgentRunner, T: TestRunner>(
        &'a self,
        agent: &'a A,
        tests: &'a T,
    ) -> PipelineEngine<'a, A, T> {
        PipelineEngine {
            config: &self.config,
            paths: &self.paths,
            store: &self.store,
            ledger: &self.ledger,
            memory: &self.memory,
            worktrees: &self.worktrees,
            intervention: &self.intervention,
            agent,
            tests,
            clock: &self.clock,
        }
    }

    /// A plain directory standing in for a run's worktree, so engine
    /// tests need no git repository.
    pub fn fake_worktree(&self, run_id: &str) -> String {
        let path = self.temp.path().join("fake-worktrees").join(run_id);
        std::fs::create_dir_all(&path).expect("create fake worktree");
        path.to_string_lossy().into_owned()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize a seed git repository so worktree allocation works.
fn init_git_repo(root: &std::path::Path) {
    let run = |args: &[&str]| {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?}");
    };
    run(&["init", "--quiet", "--initial-branch=main"]);
    run(&["config", "user.email", "conductor@test"]);
    run(&["config", "user.name", "conductor"]);
    std::fs::write(root.join("README.md"), "seed\n").expect("seed file");
    run(&["add", "-A"]);
    run(&["commit", "--quiet", "-m", "seed"]);
}
