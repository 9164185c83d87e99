//! Serializable fleet-state snapshot for dashboard consumers.
//!
//! The core only assembles the snapshot; the transport (push socket,
//! poll endpoint) is an external concern.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{Event, MachineNode, Run, WorkItem};
use crate::daemon::{DaemonInfo, WorkSource};
use crate::fleet::FleetCoordinator;
use crate::intervention::InterventionBus;
use crate::io::ledger::{BudgetSummary, CostLedger};
use crate::io::state_store::{NotFoundError, StateStore};

/// Events included in the snapshot tail.
const RECENT_EVENTS: usize = 20;

/// Point-in-time view of the whole orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct FleetState {
    pub generated_at: DateTime<Utc>,
    pub daemon: Option<DaemonInfo>,
    pub admission_paused: bool,
    pub emergency_brake: bool,
    pub active_runs: Vec<Run>,
    pub queue: Vec<WorkItem>,
    pub recent_events: Vec<Event>,
    pub machines: Vec<MachineNode>,
    pub budget: BudgetSummary,
}

/// Assemble a snapshot. Pure read; safe to call while a daemon runs.
pub fn snapshot<W: WorkSource>(
    store: &StateStore,
    ledger: &CostLedger,
    fleet: &FleetCoordinator<'_>,
    intervention: &InterventionBus,
    work_source: &W,
    now: DateTime<Utc>,
) -> Result<FleetState> {
    let daemon = match store.get::<DaemonInfo>("daemon") {
        Ok(info) => Some(info),
        Err(err) if err.downcast_ref::<NotFoundError>().is_some() => None,
        Err(err) => return Err(err),
    };

    let mut active_runs = Vec::new();
    for key in store.list("runs")? {
        let run: Run = store.get(&key)?;
        if !run.status.is_terminal() {
            active_runs.push(run);
        }
    }
    active_runs.sort_by(|a, b| a.id.cmp(&b.id));

    let mut recent_events = store.read_events()?;
    if recent_events.len() > RECENT_EVENTS {
        recent_events.drain(..recent_events.len() - RECENT_EVENTS);
    }

    let registry = fleet.registry()?;
    let machines: Vec<MachineNode> = registry.nodes.values().cloned().collect();
    let state = intervention.load()?;

    Ok(FleetState {
        generated_at: now,
        daemon,
        admission_paused: state.daemon_paused,
        emergency_brake: state.emergency_brake,
        active_runs,
        queue: work_source.fetch()?,
        recent_events,
        machines,
        budget: ledger.summary(now)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::Clock;
    use crate::fleet::StaticHeadroomProbe;
    use crate::io::config::ConductorConfig;
    use crate::test_support::{Harness, StaticWorkSource, item};

    #[test]
    fn snapshot_reflects_runs_queue_and_budget() {
        let harness = Harness::new();
        let agent = crate::test_support::ScriptedAgent::always_complete();
        let tests = crate::test_support::ScriptedTests::always_pass();
        let engine = harness.engine(&agent, &tests);
        engine.create_run(&item("42")).expect("create");

        let config = ConductorConfig::default();
        let probe = StaticHeadroomProbe(None);
        let fleet = FleetCoordinator {
            config: &config,
            store: &harness.store,
            probe: &probe,
        };
        let source = StaticWorkSource::new(vec![item("77")]);

        let state = snapshot(
            &harness.store,
            &harness.ledger,
            &fleet,
            &harness.intervention,
            &source,
            harness.clock.now(),
        )
        .expect("snapshot");

        assert_eq!(state.active_runs.len(), 1);
        assert_eq!(state.active_runs[0].id, "42");
        assert_eq!(state.queue.len(), 1);
        assert!(state.budget.daily_limit_usd > 0.0);
        assert!(!state.admission_paused);
        // The snapshot must serialize for external transports.
        serde_json::to_string(&state).expect("serialize");
    }
}
