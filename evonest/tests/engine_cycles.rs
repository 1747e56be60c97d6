//! End-to-end engine runs over scripted LM responses and real git repos.

mod common;

use std::sync::Arc;

use common::*;
use evonest::error::EngineError;
use evonest::state::types::{BacklogStatus, Outcome};
use evonest::{AnalyzeOptions, EvolveOptions, ImproveOptions, ProjectState};

#[tokio::test]
async fn analyze_writes_proposals_and_never_commits() {
    let (dir, state) = init_git_project();
    let runner = Arc::new(FakeRunner::new());
    runner.push_text("observe", &observe_response("Tighten error handling"));
    let commits_before = commit_count(dir.path());

    let engine = engine_with(state.clone(), "{}", runner);
    let summary = engine
        .analyze(AnalyzeOptions {
            cycles: Some(1),
            all_personas: false,
        })
        .await
        .unwrap();

    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(!state.list_proposals().unwrap().is_empty());
    assert_eq!(commit_count(dir.path()), commits_before);
    // Nothing outside .evonest/ was touched.
    assert_eq!(git(dir.path(), &["status", "--porcelain"]), "");
    // Lock released.
    assert!(!state.lock_path().exists());
}

#[tokio::test]
async fn evolve_commits_when_verify_gates_are_null() {
    let (dir, state) = init_git_project();
    let runner = Arc::new(FakeRunner::new());
    runner.push_text("observe", &observe_response("Add greeting module"));
    runner.push_text("plan", &plan_response("add-greeting-module", "src/demo.rs"));
    let repo = dir.path().to_path_buf();
    runner.push("execute", move |_| {
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/demo.rs"), "pub fn hello() {}\n").unwrap();
        Ok(execute_response(&["src/demo.rs"]))
    });
    let commits_before = commit_count(dir.path());

    let engine = engine_with(state.clone(), "{}", runner);
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1, "lines: {:?}", summary.status_lines);
    assert_eq!(commit_count(dir.path()), commits_before + 1);
    assert!(git(dir.path(), &["log", "-1", "--format=%s"]).contains("src/demo.rs"));

    let history = state.read_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, Outcome::Success);
    assert!(history[0].commit_sha.is_some());
    assert!(history[0].files_touched.contains(&"src/demo.rs".to_string()));

    // The backlog item completed.
    let backlog = state.load_backlog().unwrap();
    assert_eq!(backlog[0].status, BacklogStatus::Completed);
}

#[tokio::test]
async fn evolve_with_failing_test_reverts_byte_for_byte() {
    let (dir, state) = init_git_project();
    let readme_before = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.push_text("observe", &observe_response("Break something"));
    runner.push_text("plan", &plan_response("break-something", "README.md"));
    let repo = dir.path().to_path_buf();
    runner.push("execute", move |_| {
        std::fs::write(repo.join("README.md"), "# Broken\n").unwrap();
        std::fs::write(repo.join("stray.txt"), "junk").unwrap();
        Ok(execute_response(&["README.md", "stray.txt"]))
    });
    let commits_before = commit_count(dir.path());

    let engine = engine_with(state.clone(), r#"{ "verify": { "test": "false" } }"#, runner);
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(summary.any_failed(), "run-level verify failure drives exit 4");

    // Working tree identical to before.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
        readme_before
    );
    assert!(!dir.path().join("stray.txt").exists());
    assert_eq!(commit_count(dir.path()), commits_before);
    assert_eq!(git(dir.path(), &["status", "--porcelain"]), "");

    let history = state.read_history(10).unwrap();
    assert_eq!(history[0].outcome, Outcome::Failure);
    assert!(history[0]
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("verify test failed"));

    // Failed attempt went back to pending.
    let backlog = state.load_backlog().unwrap();
    assert_eq!(backlog[0].status, BacklogStatus::Pending);
    assert_eq!(backlog[0].attempts, 1);

    assert!(!state.lock_path().exists(), "lock released after run");
}

#[tokio::test]
async fn improve_design_only_proposal_is_archived_as_skipped() {
    let (dir, state) = init_git_project();
    let filename = state
        .create_proposal("# Rethink the module layout\n\nAdvice only, no code.\n")
        .unwrap();
    let runner = Arc::new(FakeRunner::new());
    // Execute runs but writes nothing.
    runner.push_text("execute", r#"{"files_modified": [], "files_created": [], "summary": "nothing to change"}"#);
    let commits_before = commit_count(dir.path());

    let engine = engine_with(state.clone(), "{}", runner);
    let summary = engine.improve(ImproveOptions::default()).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(!summary.any_failed());
    assert!(state.list_proposals().unwrap().is_empty());
    assert!(state.proposals_done_dir().join(&filename).exists());
    assert_eq!(commit_count(dir.path()), commits_before);

    let history = state.read_history(10).unwrap();
    assert_eq!(history[0].outcome, Outcome::Skipped);
}

#[tokio::test]
async fn improve_missing_proposal_errors() {
    let (_dir, state) = init_git_project();
    let engine = engine_with(state, "{}", Arc::new(FakeRunner::new()));
    let err = engine
        .improve(ImproveOptions {
            proposal: Some("no-such".into()),
            all: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }));
}

#[tokio::test]
async fn cautious_pause_resumes_in_a_new_engine() -> anyhow::Result<()> {
    let (dir, state) = init_git_project();
    let runner = Arc::new(FakeRunner::new());
    runner.push_text("observe", &observe_response("Add greeting module"));
    runner.push_text("plan", &plan_response("add-greeting-module", "src/demo.rs"));

    // Process A: pauses after plan.
    let engine_a = engine_with(state.clone(), "{}", runner);
    let summary_a = engine_a
        .evolve(EvolveOptions {
            cycles: Some(1),
            cautious: true,
            ..Default::default()
        })
        .await?;
    assert!(summary_a.paused);
    assert_eq!(summary_a.attempted, 0, "paused cycle not yet recorded");
    assert!(state.cautious_resume_path().exists());
    assert!(!state.lock_path().exists(), "pause released the lock");
    assert!(state.read_history(10)?.is_empty());

    // Process B: fresh engine + runner, resumes at Execute.
    let runner_b = Arc::new(FakeRunner::new());
    let repo = dir.path().to_path_buf();
    runner_b.push("execute", move |_| {
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/demo.rs"), "pub fn hello() {}\n").unwrap();
        Ok(execute_response(&["src/demo.rs"]))
    });
    let state_b = ProjectState::open(dir.path())?;
    let engine_b = engine_with(state_b.clone(), "{}", runner_b);
    let summary_b = engine_b.resume().await?;

    assert_eq!(summary_b.succeeded, 1);
    assert!(!state_b.cautious_resume_path().exists(), "token removed");
    let history = state_b.read_history(10)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, Outcome::Success);

    // Process C: nothing left to resume.
    let engine_c = engine_with(ProjectState::open(dir.path())?, "{}", Arc::new(FakeRunner::new()));
    let err = engine_c.resume().await.unwrap_err();
    assert!(matches!(err, EngineError::NothingToResume));
    Ok(())
}

#[tokio::test]
async fn plan_null_skips_remaining_cycles() {
    let (_dir, state) = init_git_project();
    let runner = Arc::new(FakeRunner::new());
    // Three cycles budgeted, but the first plan returns null.
    runner.push_text("observe", &observe_response("Something"));
    runner.push_text("plan", r#"{"selected_improvement": null}"#);

    let engine = engine_with(state.clone(), "{}", runner);
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(state.read_history(10).unwrap().len(), 1);
}

#[tokio::test]
async fn zero_cycles_does_nothing_and_exits_clean() {
    let (_dir, state) = init_git_project();
    let engine = engine_with(state.clone(), "{}", Arc::new(FakeRunner::new()));
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert!(!summary.any_failed());
    assert!(!state.lock_path().exists());
}

#[tokio::test]
async fn all_personas_disabled_is_structured_error() {
    let (_dir, state) = init_git_project();
    let config = r#"{ "active_groups": ["tech"], "personas": {
        "architect": false, "performance-engineer": false, "reliability-engineer": false
    } }"#;
    let engine = engine_with(state, config, Arc::new(FakeRunner::new()));
    let err = engine.evolve(EvolveOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::NoMutations));
}

#[tokio::test]
async fn boundary_violation_fails_and_reverts_the_cycle() {
    let (dir, state) = init_git_project();
    state
        .write_identity(
            "# Identity\n\n## Mission\n\nShip.\n\n## Boundaries\n\n- secrets/\n",
        )
        .unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.push_text("observe", &observe_response("Touch config"));
    runner.push_text("plan", &plan_response("touch-config", "src/demo.rs"));
    let repo = dir.path().to_path_buf();
    runner.push("execute", move |_| {
        // The model ignores the plan and writes into a protected path.
        std::fs::create_dir_all(repo.join("secrets")).unwrap();
        std::fs::write(repo.join("secrets/key.txt"), "hunter2").unwrap();
        Ok(execute_response(&["secrets/key.txt"]))
    });

    let engine = engine_with(state.clone(), "{}", runner);
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(!dir.path().join("secrets/key.txt").exists(), "reverted");
    let history = state.read_history(10).unwrap();
    assert!(history[0]
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("protected path"));
}

#[tokio::test]
async fn stop_decision_ends_the_run_before_any_phase() {
    let (_dir, state) = init_git_project();
    std::fs::write(state.decisions_dir().join("halt.md"), "stop\n").unwrap();

    let engine = engine_with(state.clone(), "{}", Arc::new(FakeRunner::new()));
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.attempted, 0);
    // The stop decision was consumed (single-shot).
    assert!(state.list_decisions().unwrap().is_empty());
}

#[tokio::test]
async fn gate_phases_apply_mutations_advice_and_dedupe_scout_findings() -> anyhow::Result<()> {
    let (dir, state) = init_git_project();
    let config = r#"{
        "meta_cycle_interval": 1,
        "scout_cycle_interval": 1,
        "adversarial_probability": 0.0
    }"#;

    let meta_response = r#"{
        "new_personas": [{"name": "Cache Whisperer", "group": "tech", "perspective": "caching"}],
        "new_adversarials": [],
        "auto_stimuli": [{"title": "from-meta", "content": "look at io"}],
        "advice": "focus on io for a few cycles"
    }"#;
    let scout_response = r#"{
        "findings": [
            {"title": "New lint", "source_url": "https://x", "relevance_score": 9, "summary": "s"},
            {"title": "Low signal", "source_url": "https://y", "relevance_score": 2, "summary": "s"}
        ]
    }"#;
    let empty_observe = r#"{"improvements": [], "observations": "quiet"}"#;
    let plan_null = r#"{"selected_improvement": null}"#;

    let script = |runner: &FakeRunner| {
        runner.push_text("meta-observe", meta_response);
        runner.push_text("scout", scout_response);
        runner.push_text("observe", empty_observe);
        runner.push_text("plan", plan_null);
    };

    // First run: gates fire on cycle 1.
    let runner = Arc::new(FakeRunner::new());
    script(&runner);
    let engine = engine_with(state.clone(), config, runner);
    engine
        .evolve(EvolveOptions {
            cycles: Some(1),
            ..Default::default()
        })
        .await?;

    let dynamic = state.read_dynamic_personas()?;
    assert_eq!(dynamic.len(), 1);
    assert_eq!(dynamic[0].id, "cache-whisperer");
    assert!(dynamic[0].ttl_cycles.is_some());

    let advice = state.read_advice()?.expect("advice written");
    assert!(advice.direction.contains("focus on io"));

    // Both gate stimuli were consumed by this cycle's observe.
    assert!(state.list_stimuli()?.is_empty());
    let cache = state.read_scout_cache()?;
    assert_eq!(cache.entries.len(), 1, "only the high-score finding cached");

    // Second run: the same finding must not be injected again, and the
    // duplicate persona proposal is skipped.
    let runner = Arc::new(FakeRunner::new());
    script(&runner);
    let engine = engine_with(ProjectState::open(dir.path())?, config, runner);
    engine
        .evolve(EvolveOptions {
            cycles: Some(1),
            ..Default::default()
        })
        .await?;

    assert_eq!(state.read_dynamic_personas()?.len(), 1);
    assert_eq!(state.read_scout_cache()?.entries.len(), 1);
    let scout_stimuli: Vec<_> = std::fs::read_dir(state.stimuli_processed_dir())?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains("new-lint"))
        .collect();
    assert_eq!(scout_stimuli.len(), 1, "scout finding surfaced exactly once");
    Ok(())
}

#[tokio::test]
async fn evolve_proposal_category_writes_proposal_without_touching_source() {
    let (dir, state) = init_git_project();
    let runner = Arc::new(FakeRunner::new());
    runner.push_text(
        "observe",
        r#"{
            "improvements": [
                {"title": "Consider plugin architecture", "description": "design advice",
                 "category": "proposal", "priority": "medium", "files": []}
            ],
            "observations": ""
        }"#,
    );
    runner.push_text(
        "plan",
        r#"{
            "selected_improvement": "consider-plugin-architecture",
            "steps": ["sketch the seams"],
            "expected_outcome": "a design note",
            "commit_message": "n/a"
        }"#,
    );
    let commits_before = commit_count(dir.path());

    let engine = engine_with(state.clone(), "{}", runner);
    let summary = engine
        .evolve(EvolveOptions {
            cycles: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(commit_count(dir.path()), commits_before);
    assert_eq!(state.list_proposals().unwrap().len(), 1);
    let backlog = state.load_backlog().unwrap();
    assert_eq!(backlog[0].status, BacklogStatus::Completed);
}
