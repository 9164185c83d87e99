//! Conductor CLI: run, daemon and fleet management.
//!
//! All durable state lives under `.conductor/` in the current
//! directory; the daemon and one-off commands coordinate exclusively
//! through that state (atomic record replace plus an append-only event
//! log), never through shared memory.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use conductor::core::clock::{Clock, SystemClock};
use conductor::core::types::{Run, RunStatus, WorkItem};
use conductor::daemon::{Daemon, FileWorkSource};
use conductor::dashboard;
use conductor::engine::{DuplicateRunError, PipelineEngine};
use conductor::exit_codes;
use conductor::fleet::{
    CapacityUnavailableError, FleetCoordinator, InvalidJoinTokenError, ProcHeadroomProbe,
};
use conductor::intervention::InterventionBus;
use conductor::io::agent::SubprocessAgent;
use conductor::io::config::{ConductorConfig, load_config, write_config};
use conductor::io::ledger::{BudgetExceededError, CostLedger};
use conductor::io::memory::MemoryIndex;
use conductor::io::paths::StatePaths;
use conductor::io::state_store::{NotFoundError, StateStore, write_atomic};
use conductor::io::test_command::CommandTestRunner;
use conductor::io::worktree::WorktreeManager;
use conductor::logging;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Autonomous delivery-pipeline orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` scaffolding (config, queue, state dirs).
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Manage pipeline runs.
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    /// Manage the scheduling daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Manage the machine fleet.
    Fleet {
        #[command(subcommand)]
        command: FleetCommand,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Admit and execute a run for a work item.
    Start {
        /// Work-item identifier (e.g. issue number).
        id: String,
        /// Work-item title.
        #[arg(short, long, default_value = "")]
        title: String,
        /// Print the stage/cost/duration estimate table and exit.
        #[arg(long)]
        dry_run: bool,
    },
    /// Resume a run from its last checkpoint.
    Resume { id: String },
    /// Show run status (all runs and fleet state when no id given).
    Status { id: Option<String> },
    /// Abort a run.
    Abort { id: String },
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Run the scheduling loop in the foreground.
    Start,
    /// Request an orderly stop at the next cycle boundary.
    Stop,
    /// Pause admission (in-flight runs continue).
    Pause,
    /// Resume admission; also releases an engaged emergency brake.
    Resume,
    /// Abort all active runs and pause admission.
    EmergencyBrake,
}

#[derive(Subcommand)]
enum FleetCommand {
    /// Register a machine using a join token.
    Join {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 2)]
        max_workers: u32,
        #[arg(long)]
        token: String,
    },
    /// Remove a machine from the registry.
    Leave { name: String },
    /// Show the machine registry.
    Status,
    /// Mint a short-lived join token.
    Token,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(classify_error(&err));
        }
    }
}

fn classify_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<DuplicateRunError>().is_some()
        || err.downcast_ref::<InvalidJoinTokenError>().is_some()
        || err.downcast_ref::<BudgetExceededError>().is_some()
        || err.downcast_ref::<CapacityUnavailableError>().is_some()
    {
        exit_codes::CHECK_FAILED
    } else {
        exit_codes::ERROR
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run { command } => {
            let app = App::open(&root)?;
            match command {
                RunCommand::Start { id, title, dry_run } => app.run_start(&id, &title, dry_run),
                RunCommand::Resume { id } => app.run_resume(&id),
                RunCommand::Status { id } => app.run_status(id.as_deref()),
                RunCommand::Abort { id } => app.run_abort(&id),
            }
        }
        Command::Daemon { command } => {
            let app = App::open(&root)?;
            match command {
                DaemonCommand::Start => app.daemon_start(),
                DaemonCommand::Stop => {
                    app.intervention.stop_daemon()?;
                    Ok(exit_codes::OK)
                }
                DaemonCommand::Pause => {
                    app.intervention.pause_daemon()?;
                    Ok(exit_codes::OK)
                }
                DaemonCommand::Resume => {
                    app.intervention.resume_daemon()?;
                    Ok(exit_codes::OK)
                }
                DaemonCommand::EmergencyBrake => {
                    app.intervention.emergency_brake()?;
                    Ok(exit_codes::OK)
                }
            }
        }
        Command::Fleet { command } => {
            let app = App::open(&root)?;
            let fleet = app.fleet();
            let now = app.clock.now();
            match command {
                FleetCommand::Join {
                    name,
                    host,
                    max_workers,
                    token,
                } => {
                    fleet.join(&name, &host, max_workers, &token, now)?;
                    println!("joined {name}");
                    Ok(exit_codes::OK)
                }
                FleetCommand::Leave { name } => {
                    fleet.leave(&name, now)?;
                    println!("left {name}");
                    Ok(exit_codes::OK)
                }
                FleetCommand::Status => {
                    let registry = fleet.registry()?;
                    for node in registry.nodes.values() {
                        println!(
                            "{:<16} {:<8} {:>2}/{:<2} workers  last heartbeat {}",
                            node.name,
                            format!("{:?}", node.status).to_lowercase(),
                            node.active_workers,
                            node.max_workers,
                            node.last_heartbeat_at.to_rfc3339()
                        );
                    }
                    Ok(exit_codes::OK)
                }
                FleetCommand::Token => {
                    let token = fleet.mint_join_token(now)?;
                    println!("{token}");
                    Ok(exit_codes::OK)
                }
            }
        }
    }
}

/// Assembled production components over one orchestrator root.
struct App {
    config: ConductorConfig,
    paths: StatePaths,
    store: StateStore,
    ledger: CostLedger,
    memory: MemoryIndex,
    worktrees: WorktreeManager,
    intervention: InterventionBus,
    clock: SystemClock,
    agent: SubprocessAgent,
    tests: CommandTestRunner,
    probe: ProcHeadroomProbe,
}

impl App {
    fn open(root: &Path) -> Result<Self> {
        let paths = StatePaths::new(root);
        let config = load_config(&paths.config_path)?;
        let clock = SystemClock;
        let store = StateStore::new(&paths.state_dir, &paths.events_path);
        let ledger = CostLedger::open(&paths.ledger_path, config.daily_budget_usd, clock.now())?;
        let memory = MemoryIndex::new(&paths.memory_dir);
        let worktrees = WorktreeManager::new(&paths.root, &paths.worktrees_dir);
        let intervention = InterventionBus::new(&paths.interventions_path);
        let agent = SubprocessAgent::new(config.agent.program.clone());
        Ok(Self {
            config,
            paths,
            store,
            ledger,
            memory,
            worktrees,
            intervention,
            clock,
            agent,
            tests: CommandTestRunner,
            probe: ProcHeadroomProbe,
        })
    }

    fn engine(&self) -> PipelineEngine<'_, SubprocessAgent, CommandTestRunner> {
        PipelineEngine {
            config: &self.config,
            paths: &self.paths,
            store: &self.store,
            ledger: &self.ledger,
            memory: &self.memory,
            worktrees: &self.worktrees,
            intervention: &self.intervention,
            agent: &self.agent,
            tests: &self.tests,
            clock: &self.clock,
        }
    }

    fn fleet(&self) -> FleetCoordinator<'_> {
        FleetCoordinator {
            config: &self.config,
            store: &self.store,
            probe: &self.probe,
        }
    }

    fn run_start(&self, id: &str, title: &str, dry_run: bool) -> Result<i32> {
        let engine = self.engine();
        if dry_run {
            let table = engine.dry_run()?;
            print!("{}", table.render());
            return Ok(exit_codes::OK);
        }

        let now = self.clock.now();
        let table = engine.dry_run()?;
        if !self.ledger.reserve(id, table.total_cost_usd, now)? {
            return Err(anyhow!(BudgetExceededError {
                estimated_usd: table.total_cost_usd
            }));
        }
        let fleet = self.fleet();
        fleet.ensure_local_node(now)?;
        if !fleet.has_capacity(now)? {
            self.ledger.release(id)?;
            return Err(anyhow!(CapacityUnavailableError));
        }

        let item = WorkItem {
            id: id.to_string(),
            title: if title.is_empty() {
                format!("work item {id}")
            } else {
                title.to_string()
            },
            labels: Vec::new(),
            factors: Default::default(),
            triage_score: 0.0,
            estimated_cost_usd: table.total_cost_usd,
        };
        let mut run = match engine.create_run(&item) {
            Ok(run) => run,
            Err(err) => {
                self.ledger.release(id)?;
                return Err(err);
            }
        };
        let machine = fleet.place(&run.id, now)?;
        engine.assign_machine(&mut run, machine.as_deref())?;
        let status = engine.execute(&mut run)?;
        if status.is_terminal()
            && let Some(machine) = run.machine_id.as_deref()
        {
            fleet.release_slot(machine)?;
        }
        println!("run {id}: {status:?}");
        Ok(status_exit_code(status))
    }

    fn run_resume(&self, id: &str) -> Result<i32> {
        let engine = self.engine();
        // A paused run stays parked until the operator clears the flag.
        self.intervention.resume(id)?;
        let mut run = engine.resume(id)?;
        if run.status.is_terminal() {
            println!("run {id}: {:?} (terminal)", run.status);
            return Ok(exit_codes::OK);
        }
        let status = engine.execute(&mut run)?;
        println!("run {id}: {status:?}");
        Ok(status_exit_code(status))
    }

    fn run_status(&self, id: Option<&str>) -> Result<i32> {
        match id {
            Some(id) => {
                let run: Run = match self.store.get(&StatePaths::run_key(id)) {
                    Ok(run) => run,
                    Err(err) if err.downcast_ref::<NotFoundError>().is_some() => {
                        println!("run {id}: not found");
                        return Ok(exit_codes::ERROR);
                    }
                    Err(err) => return Err(err),
                };
                println!(
                    "run {}: {:?} (stage {}, {} completed, {} iterations, ${:.2})",
                    run.id,
                    run.status,
                    run.current_stage,
                    run.stages_completed.len(),
                    run.iteration_count,
                    run.cost_so_far_usd
                );
                if let Some(diagnostic) = self.last_diagnostic(id)? {
                    println!("last diagnostic: {diagnostic}");
                }
            }
            None => {
                let fleet = self.fleet();
                let source = FileWorkSource::new(&self.paths.queue_path);
                let state = dashboard::snapshot(
                    &self.store,
                    &self.ledger,
                    &fleet,
                    &self.intervention,
                    &source,
                    self.clock.now(),
                )?;
                let mut rendered = serde_json::to_string_pretty(&state)?;
                rendered.push('\n');
                print!("{rendered}");
            }
        }
        Ok(exit_codes::OK)
    }

    /// Most recent event payload `error` for a run, if any.
    fn last_diagnostic(&self, run_id: &str) -> Result<Option<String>> {
        let events = self.store.read_events()?;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.run_id.as_deref() == Some(run_id))
            .find_map(|e| e.payload.get("error").cloned()))
    }

    fn run_abort(&self, id: &str) -> Result<i32> {
        let engine = self.engine();
        self.intervention.abort(id)?;
        let run: Run = match self.store.get(&StatePaths::run_key(id)) {
            Ok(run) => run,
            Err(err) if err.downcast_ref::<NotFoundError>().is_some() => {
                println!("run {id}: not found");
                return Ok(exit_codes::ERROR);
            }
            Err(err) => return Err(err),
        };
        // Queued/paused runs are finalized here; an actively executing
        // run is finalized by its daemon at the next checkpoint
        // boundary.
        if matches!(run.status, RunStatus::Queued | RunStatus::Paused) {
            let status = engine.abort_run(id)?;
            println!("run {id}: {status:?}");
        } else {
            println!("run {id}: abort requested");
        }
        Ok(exit_codes::OK)
    }

    fn daemon_start(&self) -> Result<i32> {
        let engine = self.engine();
        let fleet = self.fleet();
        let source = FileWorkSource::new(&self.paths.queue_path);
        let mut daemon = Daemon::new(engine, fleet, &source);
        daemon.run_forever()?;
        println!("daemon stopped");
        Ok(exit_codes::OK)
    }
}

fn status_exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded | RunStatus::Paused | RunStatus::Aborted => exit_codes::OK,
        _ => exit_codes::ERROR,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = StatePaths::new(root);
    if paths.conductor_dir.exists() && !force {
        return Err(anyhow!(
            "conductor init: .conductor already exists (use --force to overwrite)"
        ));
    }
    std::fs::create_dir_all(&paths.state_dir).context("create state directory")?;
    std::fs::create_dir_all(&paths.runs_dir).context("create runs directory")?;
    std::fs::create_dir_all(&paths.checkpoints_dir).context("create checkpoints directory")?;
    std::fs::create_dir_all(&paths.memory_dir).context("create memory directory")?;
    std::fs::create_dir_all(&paths.worktrees_dir).context("create worktrees directory")?;
    std::fs::create_dir_all(&paths.logs_dir).context("create logs directory")?;
    write_config(&paths.config_path, &ConductorConfig::default())?;
    if force || !paths.queue_path.exists() {
        write_atomic(&paths.queue_path, "[]\n")?;
    }
    println!("initialized {}", paths.conductor_dir.display());
    Ok(exit_codes::OK)
}
