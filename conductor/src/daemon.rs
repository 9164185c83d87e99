//! Scheduling/triage daemon loop.
//!
//! One long-lived daemon per fleet leader: poll the work source, score
//! and rank candidates, admit under budget and capacity, place runs on
//! the fleet and execute the locally-placed ones. The daemon itself
//! holds no per-run state beyond the poll cursor; all run state lives in
//! the state store, so a restarted daemon rehydrates in-flight runs from
//! their checkpoints.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::triage::rank_candidates;
use crate::core::types::{Event, Run, RunStatus, WorkItem};
use crate::engine::{CorruptCheckpointError, DuplicateRunError, PipelineEngine};
use crate::fleet::FleetCoordinator;
use crate::io::agent::AgentRunner;
use crate::io::memory::memory_signal;
use crate::io::state_store::write_atomic;
use crate::io::test_command::TestRunner;

/// External work-intake seam.
///
/// The core consumes candidate items; it does not implement the
/// tracker's protocol. `acknowledge` removes an item once a run has been
/// created for it, so completed work is not re-admitted.
pub trait WorkSource {
    fn fetch(&self) -> Result<Vec<WorkItem>>;
    fn acknowledge(&self, id: &str) -> Result<()> {
        let _ = id;
        Ok(())
    }
}

/// Drop-box work source: an external tracker sync writes a JSON array
/// of work items to `.conductor/queue.json`.
pub struct FileWorkSource {
    path: PathBuf,
}

impl FileWorkSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WorkSource for FileWorkSource {
    fn fetch(&self) -> Result<Vec<WorkItem>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read queue {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse queue {}", self.path.display()))
    }

    fn acknowledge(&self, id: &str) -> Result<()> {
        let mut items = self.fetch()?;
        items.retain(|item| item.id != id);
        let mut buf = serde_json::to_string_pretty(&items).context("serialize queue")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

/// Daemon bookkeeping persisted for status/dashboard consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub machine: String,
    pub started_at: DateTime<Utc>,
    pub last_cycle_at: DateTime<Utc>,
    pub cycles: u64,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub admitted: Vec<String>,
    /// Deferred candidates with the reason (`budget` or `capacity`).
    pub deferred: Vec<(String, String)>,
    pub executed: Vec<(String, RunStatus)>,
    pub reassigned: Vec<String>,
}

/// Why `run_once` returned without a full cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Worked(CycleSummary),
    /// Admission is paused (operator pause or emergency brake).
    Paused,
    /// Orderly stop was requested.
    Stopped,
}

/// The scheduler: drives admission and local execution.
pub struct Daemon<'a, A: AgentRunner, T: TestRunner, W: WorkSource> {
    pub engine: PipelineEngine<'a, A, T>,
    pub fleet: FleetCoordinator<'a>,
    pub work_source: &'a W,
    pub started_at: DateTime<Utc>,
    /// Poll cursor: the only daemon-held state.
    pub cycles: u64,
}

impl<'a, A: AgentRunner, T: TestRunner, W: WorkSource> Daemon<'a, A, T, W> {
    pub fn new(
        engine: PipelineEngine<'a, A, T>,
        fleet: FleetCoordinator<'a>,
        work_source: &'a W,
    ) -> Self {
        let started_at = engine.clock.now();
        Self {
            engine,
            fleet,
            work_source,
            started_at,
            cycles: 0,
        }
    }

    /// Rehydrate in-flight runs from checkpoints after a restart.
    ///
    /// Corrupt checkpoints mark their runs failed (with a diagnostic
    /// event) and do not stop rehydration of the rest.
    #[instrument(skip_all)]
    pub fn rehydrate(&self) -> Result<Vec<String>> {
        let mut rehydrated = Vec::new();
        for run_id in self.non_terminal_runs()? {
            match self.engine.resume(&run_id) {
                Ok(_) => rehydrated.push(run_id),
                Err(err) if err.downcast_ref::<CorruptCheckpointError>().is_some() => {
                    warn!(run_id = %run_id, "skipping run with corrupt checkpoint");
                }
                Err(err) => return Err(err),
            }
        }
        if !rehydrated.is_empty() {
            info!(count = rehydrated.len(), "runs rehydrated");
        }
        Ok(rehydrated)
    }

    /// One poll cycle: interventions, fleet refresh, orphan
    /// reconciliation, triage, admission, local execution.
    #[instrument(skip_all, fields(cycle = self.cycles))]
    pub fn run_once(&mut self) -> Result<CycleOutcome> {
        self.cycles += 1;
        let intervention = self.engine.intervention.load()?;
        if intervention.daemon_stop {
            info!("stop requested");
            return Ok(CycleOutcome::Stopped);
        }
        if intervention.emergency_brake {
            // The brake aborts every non-terminal run and pauses
            // admission until the operator resumes the daemon.
            for run_id in self.non_terminal_runs()? {
                let run = self.engine.load_run(&run_id)?;
                let status = self.engine.abort_run(&run_id)?;
                if status == RunStatus::Aborted
                    && let Some(machine) = run.machine_id.as_deref()
                {
                    self.fleet.release_slot(machine)?;
                }
            }
            self.record_cycle()?;
            return Ok(CycleOutcome::Paused);
        }
        if intervention.daemon_paused {
            self.record_cycle()?;
            return Ok(CycleOutcome::Paused);
        }

        let mut summary = CycleSummary::default();
        let now = self.engine.clock.now();

        let offline = self.fleet.refresh(now)?;
        if !offline.is_empty() {
            summary.reassigned = self.reconcile_orphans(&offline, now)?;
        }

        self.admit_candidates(&mut summary)?;
        self.place_unplaced_runs()?;
        self.execute_local_runs(&mut summary)?;
        self.record_cycle()?;

        Ok(CycleOutcome::Worked(summary))
    }

    /// Poll loop with the injected clock; returns after an orderly stop.
    pub fn run_forever(&mut self) -> Result<()> {
        self.engine.intervention.clear_stop()?;
        self.fleet.ensure_local_node(self.engine.clock.now())?;
        self.rehydrate()?;
        loop {
            match self.run_once()? {
                CycleOutcome::Stopped => return Ok(()),
                CycleOutcome::Paused | CycleOutcome::Worked(_) => {}
            }
            self.local_heartbeat()?;
            self.engine
                .clock
                .sleep(Duration::from_secs(self.engine.config.poll_interval_secs));
        }
    }

    /// Triage and admission: every candidate needs both a budget
    /// reservation and fleet capacity, or it is deferred to the next
    /// poll (never retried immediately, to avoid busy-looping on a
    /// stuck budget).
    fn admit_candidates(&mut self, summary: &mut CycleSummary) -> Result<()> {
        let mut items = self.work_source.fetch()?;
        if items.is_empty() {
            return Ok(());
        }
        let fingerprint = self.engine.fingerprint();
        let record = self.engine.memory.load(&fingerprint)?;
        for item in &mut items {
            item.factors.memory_signal = memory_signal(&record);
        }
        let ranked = rank_candidates(items, &self.engine.config.triage);

        // The per-stage estimate is template-level, so one table serves
        // every candidate this cycle.
        let estimate = self.engine.dry_run()?;
        let estimated_cost = estimate.total_cost_usd;

        for mut item in ranked {
            let now = self.engine.clock.now();
            if self.engine.has_active_run(&item.id)? {
                debug!(item_id = %item.id, "item already has a run");
                continue;
            }
            item.estimated_cost_usd = estimated_cost;

            if !self.engine.ledger.reserve(&item.id, estimated_cost, now)? {
                self.defer(summary, &item, "budget", now)?;
                continue;
            }
            if !self.fleet.has_capacity(now)? {
                self.engine.ledger.release(&item.id)?;
                self.defer(summary, &item, "capacity", now)?;
                continue;
            }

            let mut run = match self.engine.create_run(&item) {
                Ok(run) => run,
                Err(err) if err.downcast_ref::<DuplicateRunError>().is_some() => {
                    self.engine.ledger.release(&item.id)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let machine = self.fleet.place(&run.id, now)?;
            self.engine.assign_machine(&mut run, machine.as_deref())?;
            self.work_source.acknowledge(&item.id)?;
            summary.admitted.push(item.id.clone());
        }
        Ok(())
    }

    fn defer(
        &self,
        summary: &mut CycleSummary,
        item: &WorkItem,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        debug!(item_id = %item.id, reason, "candidate deferred");
        self.engine.store.append_event(
            &Event::new("item.deferred", Some(&item.id), now)
                .with("reason", reason)
                .with("estimated_cost_usd", format!("{:.4}", item.estimated_cost_usd)),
        )?;
        summary.deferred.push((item.id.clone(), reason.to_string()));
        Ok(())
    }

    /// Re-place runs orphaned by machines that just went offline, from
    /// their last checkpoint, at-least-once.
    fn reconcile_orphans(&self, offline: &[String], now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut reassigned = Vec::new();
        for run_id in self.non_terminal_runs()? {
            let run = self.engine.load_run(&run_id)?;
            let Some(machine) = run.machine_id.as_deref() else {
                continue;
            };
            if !offline.iter().any(|name| name == machine) {
                continue;
            }
            let from = machine.to_string();
            let mut run = match self.engine.resume(&run_id) {
                Ok(run) => run,
                Err(err) if err.downcast_ref::<CorruptCheckpointError>().is_some() => {
                    warn!(run_id = %run_id, "orphan has corrupt checkpoint, marked failed");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let placed = self.fleet.place(&run.id, now)?;
            self.engine.assign_machine(&mut run, placed.as_deref())?;
            self.engine.store.append_event(
                &Event::new("run.reassigned", Some(&run.id), now)
                    .with("from", &from)
                    .with("to", placed.as_deref().unwrap_or("unplaced")),
            )?;
            info!(run_id = %run.id, from = %from, to = ?placed, "orphan reconciled");
            reassigned.push(run.id);
        }
        Ok(reassigned)
    }

    /// Give queued runs that missed placement (no capacity at the time)
    /// another chance.
    fn place_unplaced_runs(&self) -> Result<()> {
        for run_id in self.non_terminal_runs()? {
            let mut run = self.engine.load_run(&run_id)?;
            if run.status == RunStatus::Queued && run.machine_id.is_none() {
                let now = self.engine.clock.now();
                let placed = self.fleet.place(&run.id, now)?;
                if placed.is_some() {
                    self.engine.assign_machine(&mut run, placed.as_deref())?;
                }
            }
        }
        Ok(())
    }

    /// Execute queued runs placed on this machine, one worker slot per
    /// run for its entire lifetime. Remote-placed runs are executed by
    /// their own machine's daemon.
    fn execute_local_runs(&self, summary: &mut CycleSummary) -> Result<()> {
        for run_id in self.non_terminal_runs()? {
            let mut run = self.engine.load_run(&run_id)?;
            if run.status != RunStatus::Queued {
                continue;
            }
            let local = run
                .machine_id
                .as_deref()
                .is_some_and(|machine| machine == self.engine.config.machine_name);
            if !local {
                continue;
            }
            let status = self.engine.execute(&mut run)?;
            if status.is_terminal()
                && let Some(machine) = run.machine_id.as_deref()
            {
                self.fleet.release_slot(machine)?;
            }
            summary.executed.push((run_id, status));
        }
        Ok(())
    }

    fn local_heartbeat(&self) -> Result<()> {
        let machine = &self.engine.config.machine_name;
        let mut active = 0u32;
        for run_id in self.non_terminal_runs()? {
            let run = self.engine.load_run(&run_id)?;
            if run.status == RunStatus::Active
                && run.machine_id.as_deref() == Some(machine.as_str())
            {
                active += 1;
            }
        }
        self.fleet
            .heartbeat(machine, active, self.engine.clock.now())
    }

    fn non_terminal_runs(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for key in self.engine.store.list("runs")? {
            let run: Run = self.engine.store.get(&key)?;
            if !run.status.is_terminal() {
                ids.push(run.id);
            }
        }
        Ok(ids)
    }

    fn record_cycle(&self) -> Result<()> {
        self.engine.store.put(
            "daemon",
            &DaemonInfo {
                machine: self.engine.config.machine_name.clone(),
                started_at: self.started_at,
                last_cycle_at: self.engine.clock.now(),
                cycles: self.cycles,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_work_source_roundtrip_and_acknowledge() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("queue.json");
        let source = FileWorkSource::new(&path);
        assert!(source.fetch().expect("fetch").is_empty());

        let items = vec![
            crate::test_support::item("1"),
            crate::test_support::item("2"),
        ];
        let mut buf = serde_json::to_string_pretty(&items).expect("serialize");
        buf.push('\n');
        std::fs::write(&path, buf).expect("write");

        assert_eq!(source.fetch().expect("fetch").len(), 2);
        source.acknowledge("1").expect("ack");
        let remaining = source.fetch().expect("fetch");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "2");
    }
}
