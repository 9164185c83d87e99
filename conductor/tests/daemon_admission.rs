//! Daemon triage/admission behavior: priority order, budget deferral,
//! the at-most-one-active-run gate and the emergency brake.

use conductor::core::clock::Clock;
use conductor::core::types::{RunStatus, ScoringFactors, WorkItem};
use conductor::daemon::{CycleOutcome, Daemon};
use conductor::fleet::{FleetCoordinator, StaticHeadroomProbe};
use conductor::test_support::{Harness, ScriptedAgent, ScriptedTests, StaticWorkSource, item};

fn prioritized_item(id: &str, priority: f64) -> WorkItem {
    WorkItem {
        factors: ScoringFactors {
            priority,
            ..ScoringFactors::default()
        },
        ..item(id)
    }
}

const NO_PROBE: StaticHeadroomProbe = StaticHeadroomProbe(None);

fn fleet(harness: &Harness) -> FleetCoordinator<'_> {
    FleetCoordinator {
        config: &harness.config,
        store: &harness.store,
        probe: &NO_PROBE,
    }
}

#[test]
fn admits_by_triage_score_and_executes_to_success() {
    // Scenario A: the highest-scored candidate is admitted, placed on
    // the only online machine, runs every stage and ends succeeded with
    // one pipeline.cost event within budget.
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let source = StaticWorkSource::new(vec![
        prioritized_item("40", 1.0),
        prioritized_item("42", 9.0),
        prioritized_item("41", 4.0),
    ]);
    let coordinator = fleet(&harness);
    coordinator
        .ensure_local_node(harness.clock.now())
        .expect("local node");
    let mut daemon = Daemon::new(harness.engine(&agent, &tests), coordinator, &source);

    let outcome = daemon.run_once().expect("cycle");
    let summary = match outcome {
        CycleOutcome::Worked(summary) => summary,
        other => panic!("expected a worked cycle, got {other:?}"),
    };

    assert_eq!(summary.admitted[0], "42");
    assert!(summary
        .executed
        .iter()
        .any(|(id, status)| id == "42" && *status == RunStatus::Succeeded));

    let events = harness.store.read_events().expect("events");
    let costs: Vec<f64> = events
        .iter()
        .filter(|e| e.event_type == "pipeline.cost")
        .filter_map(|e| e.payload.get("cost_usd")?.parse().ok())
        .collect();
    assert!(!costs.is_empty());
    assert!(costs.iter().all(|c| *c <= harness.config.daily_budget_usd));
}

#[test]
fn budget_shortfall_defers_candidate_without_creating_a_run() {
    // Scenario C: $10 limit with $9.50 already spent; the estimate does
    // not fit, so the candidate is deferred and no run is created.
    let config = conductor::io::config::ConductorConfig {
        daily_budget_usd: 10.0,
        ..Default::default()
    };
    let harness = Harness::with_config(config);
    let now = harness.clock.now();
    assert!(harness.ledger.reserve("earlier", 9.5, now).expect("reserve"));
    harness.ledger.record("earlier", 9.5, now).expect("record");

    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let source = StaticWorkSource::new(vec![prioritized_item("42", 5.0)]);
    let coordinator = fleet(&harness);
    coordinator.ensure_local_node(now).expect("local node");
    let mut daemon = Daemon::new(harness.engine(&agent, &tests), coordinator, &source);

    let outcome = daemon.run_once().expect("cycle");
    let summary = match outcome {
        CycleOutcome::Worked(summary) => summary,
        other => panic!("expected a worked cycle, got {other:?}"),
    };

    assert!(summary.admitted.is_empty());
    assert_eq!(summary.deferred, vec![("42".to_string(), "budget".to_string())]);

    let events = harness.store.read_events().expect("events");
    assert!(events.iter().any(|e| e.event_type == "item.deferred"
        && e.payload.get("reason").is_some_and(|r| r == "budget")));
    assert!(!events.iter().any(|e| e.event_type == "run.created"));
    assert!(!harness.store.contains("runs/42"));
}

#[test]
fn item_with_active_run_is_not_admitted_twice() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let source = StaticWorkSource::new(vec![prioritized_item("42", 5.0)]);
    let coordinator = fleet(&harness);
    coordinator
        .ensure_local_node(harness.clock.now())
        .expect("local node");

    {
        let engine = harness.engine(&agent, &tests);
        // An existing queued run for the same work item.
        engine.create_run(&item("42")).expect("create");
    }
    let mut daemon = Daemon::new(harness.engine(&agent, &tests), fleet(&harness), &source);
    let outcome = daemon.run_once().expect("cycle");
    let summary = match outcome {
        CycleOutcome::Worked(summary) => summary,
        other => panic!("expected a worked cycle, got {other:?}"),
    };
    assert!(summary.admitted.is_empty());

    // Exactly one run record and one run.created event exist.
    let events = harness.store.read_events().expect("events");
    let created = events
        .iter()
        .filter(|e| e.event_type == "run.created")
        .count();
    assert_eq!(created, 1);
}

#[test]
fn no_capacity_defers_candidate_and_releases_reservation() {
    let config = conductor::io::config::ConductorConfig {
        max_workers: 0,
        ..Default::default()
    };
    let harness = Harness::with_config(config);
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let source = StaticWorkSource::new(vec![prioritized_item("42", 5.0)]);
    let coordinator = fleet(&harness);
    coordinator
        .ensure_local_node(harness.clock.now())
        .expect("local node");
    let mut daemon = Daemon::new(harness.engine(&agent, &tests), coordinator, &source);

    let outcome = daemon.run_once().expect("cycle");
    let summary = match outcome {
        CycleOutcome::Worked(summary) => summary,
        other => panic!("expected a worked cycle, got {other:?}"),
    };
    assert_eq!(
        summary.deferred,
        vec![("42".to_string(), "capacity".to_string())]
    );
    // The optimistic reservation was rolled back.
    let budget = harness.ledger.summary(harness.clock.now()).expect("summary");
    assert_eq!(budget.reserved_usd, 0.0);
}

#[test]
fn emergency_brake_aborts_runs_and_pauses_admission() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let source = StaticWorkSource::new(vec![prioritized_item("50", 5.0)]);
    let coordinator = fleet(&harness);
    coordinator
        .ensure_local_node(harness.clock.now())
        .expect("local node");

    {
        let engine = harness.engine(&agent, &tests);
        engine.create_run(&item("42")).expect("create");
    }
    harness.intervention.emergency_brake().expect("brake");

    let mut daemon = Daemon::new(harness.engine(&agent, &tests), fleet(&harness), &source);
    let outcome = daemon.run_once().expect("cycle");
    assert_eq!(outcome, CycleOutcome::Paused);

    let engine = harness.engine(&agent, &tests);
    let run = engine.load_run("42").expect("load");
    assert_eq!(run.status, RunStatus::Aborted);

    let events = harness.store.read_events().expect("events");
    assert!(events.iter().any(|e| e.event_type == "run.aborted"));
    assert!(!events.iter().any(|e| e.event_type == "run.created"
        && e.run_id.as_deref() == Some("50")));
}

#[test]
fn stop_flag_ends_the_loop() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let source = StaticWorkSource::new(Vec::new());
    let mut daemon = Daemon::new(harness.engine(&agent, &tests), fleet(&harness), &source);

    harness.intervention.stop_daemon().expect("stop");
    let outcome = daemon.run_once().expect("cycle");
    assert_eq!(outcome, CycleOutcome::Stopped);
}
