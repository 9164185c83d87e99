//! Crash-safe resume: a run rehydrated from a checkpoint must produce
//! the same completed-stage sequence as an uninterrupted run.

use conductor::core::types::{Checkpoint, Run, RunStatus, STAGE_TEMPLATE};
use conductor::heal::checkpoint_for;
use conductor::io::paths::StatePaths;
use conductor::test_support::{Harness, ScriptedAgent, ScriptedTests, item};

#[test]
fn uninterrupted_run_completes_every_stage_in_order() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let engine = harness.engine(&agent, &tests);

    let mut run = engine.create_run(&item("42")).expect("create");
    run.worktree_path = Some(harness.fake_worktree("42"));
    let status = engine.execute(&mut run).expect("execute");

    assert_eq!(status, RunStatus::Succeeded);
    let expected: Vec<String> = STAGE_TEMPLATE.iter().map(|s| s.to_string()).collect();
    assert_eq!(run.stages_completed, expected);
}

#[test]
fn resume_from_mid_pipeline_checkpoint_is_idempotent() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let engine = harness.engine(&agent, &tests);

    // Simulate a crash after three completed stages: the persisted run
    // and checkpoint agree that `design` is next.
    let mut run = engine.create_run(&item("42")).expect("create");
    run.worktree_path = Some(harness.fake_worktree("42"));
    run.status = RunStatus::Active;
    run.current_stage = "design".to_string();
    run.stages_completed = vec![
        "intake".to_string(),
        "triage".to_string(),
        "plan".to_string(),
    ];
    harness
        .store
        .put(&StatePaths::run_key(&run.id), &run)
        .expect("put run");
    harness
        .store
        .put(&StatePaths::checkpoint_key(&run.id), &checkpoint_for(&run))
        .expect("put checkpoint");

    let mut resumed = engine.resume(&run.id).expect("resume");
    assert_eq!(resumed.current_stage, "design");
    assert_eq!(resumed.stages_completed.len(), 3);

    let status = engine.execute(&mut resumed).expect("execute");
    assert_eq!(status, RunStatus::Succeeded);

    // Same completed sequence as an uninterrupted run.
    let expected: Vec<String> = STAGE_TEMPLATE.iter().map(|s| s.to_string()).collect();
    assert_eq!(resumed.stages_completed, expected);

    // Re-entering the already-completed stages was a no-op: they were
    // started exactly zero times after the resume.
    let events = harness.store.read_events().expect("events");
    let started: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == "stage.started")
        .filter_map(|e| e.payload.get("stage"))
        .map(String::as_str)
        .collect();
    assert_eq!(started, vec!["design", "build", "test", "review", "publish"]);
}

#[test]
fn resume_restores_iteration_budget_consumed_before_the_crash() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let engine = harness.engine(&agent, &tests);

    let run = engine.create_run(&item("7")).expect("create");
    let checkpoint = Checkpoint {
        run_id: run.id.clone(),
        current_stage: "build".to_string(),
        stages_completed: vec![
            "intake".to_string(),
            "triage".to_string(),
            "plan".to_string(),
            "design".to_string(),
        ],
        iteration_count: 2,
        worktree_path: Some(harness.fake_worktree("7")),
    };
    harness
        .store
        .put(&StatePaths::checkpoint_key(&run.id), &checkpoint)
        .expect("put checkpoint");

    let resumed = engine.resume(&run.id).expect("resume");
    assert_eq!(resumed.iteration_count, 2);
    assert_eq!(resumed.current_stage, "build");
}

#[test]
fn terminal_run_resumes_as_a_no_op() {
    let harness = Harness::new();
    let agent = ScriptedAgent::always_complete();
    let tests = ScriptedTests::always_pass();
    let engine = harness.engine(&agent, &tests);

    let mut run = engine.create_run(&item("9")).expect("create");
    run.worktree_path = Some(harness.fake_worktree("9"));
    engine.execute(&mut run).expect("execute");

    let resumed: Run = engine.resume(&run.id).expect("resume");
    assert_eq!(resumed.status, RunStatus::Succeeded);
}
