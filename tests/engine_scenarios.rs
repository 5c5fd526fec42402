//! End-to-end engine scenarios driven by a scripted executor.

use std::sync::Arc;
use std::time::Duration;

use anvil::config::{AnvilConfig, AnvilToml};
use anvil::dag::{StageStatus, WorkflowStatus};
use anvil::engine::{Engine, StageSnapshot, WorkflowSnapshot, WorkflowState};
use anvil::errors::{EngineError, FatalCondition, PlanError};
use anvil::events::{Event, EventBus, EventKind, MemoryEventLog, SubscriptionFilter};
use anvil::executor::{Executors, TaskOutcome};
use anvil::jump::CounterKind;
use anvil::plan::{ModuleSpec, Plan};
use anvil::quality::{Pillar, PillarScores};
use anvil::testing::ScriptedExecutor;
use tempfile::TempDir;

fn config(dir: &TempDir, toml: AnvilToml) -> AnvilConfig {
    AnvilConfig {
        project_dir: dir.path().to_path_buf(),
        anvil_dir: dir.path().join(".anvil"),
        toml,
    }
}

fn memory_engine(dir: &TempDir, toml: AnvilToml, executor: &ScriptedExecutor) -> Engine {
    Engine::new(
        config(dir, toml),
        Arc::new(MemoryEventLog::new()),
        EventBus::new(1024),
        Executors::uniform(Arc::new(executor.clone())),
    )
}

fn sqlite_engine(dir: &TempDir, executor: &ScriptedExecutor) -> Engine {
    Engine::open(
        config(dir, AnvilToml::default()),
        Executors::uniform(Arc::new(executor.clone())),
    )
    .unwrap()
}

fn modules(ids: &[&str]) -> Plan {
    Plan::new("modular").with_modules(
        ids.iter()
            .map(|id| ModuleSpec::new(id).with_files(&[&format!("src/{}.rs", id)]))
            .collect(),
    )
}

fn uniform_scores(value: f64) -> PillarScores {
    [
        Pillar::Tested,
        Pillar::Readable,
        Pillar::Understandable,
        Pillar::Secured,
        Pillar::Trackable,
    ]
    .into_iter()
    .map(|p| (p, value))
    .collect()
}

fn stage<'a>(snapshot: &'a WorkflowSnapshot, id: &str) -> &'a StageSnapshot {
    snapshot
        .stages
        .iter()
        .find(|s| s.id == id)
        .unwrap_or_else(|| panic!("no stage {}", id))
}

fn position(order: &[String], stage: &str) -> usize {
    order
        .iter()
        .position(|s| s == stage)
        .unwrap_or_else(|| panic!("{} never ran", stage))
}

fn counter_values(events: &[Event], stage: &str, kind: CounterKind) -> Vec<u32> {
    events
        .iter()
        .filter(|e| e.stage() == Some(stage))
        .filter_map(|e| match &e.kind {
            EventKind::CounterIncremented { counter, value } if *counter == kind => Some(*value),
            _ => None,
        })
        .collect()
}

mod serial {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_runs_stages_in_order() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new();
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&Plan::new("serial")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            executor.call_order(),
            vec!["plan", "setup", "write_tests", "implement", "validate", "quality"]
        );
        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(stage(&snapshot, "repair").status, StageStatus::NotStarted);
        assert_eq!(snapshot.scopes["main"], WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_validate_repair_loop_counts_up() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().script(
            "validate",
            vec![
                TaskOutcome::failure("tests failing"),
                TaskOutcome::failure("tests failing"),
                TaskOutcome::failure("tests failing"),
            ],
        );
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&Plan::new("repair")).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(executor.count("validate"), 4);
        assert_eq!(executor.count("repair"), 3);

        let history = engine.history(&outcome.workflow_id, 1).await.unwrap();
        assert_eq!(
            counter_values(&history, "validate", CounterKind::RepairAttempt),
            vec![1, 2, 3]
        );
        // Every repair runs between two validate attempts.
        let order = executor.call_order();
        let first_repair = position(&order, "repair");
        assert_eq!(order[first_repair - 1], "validate");
        assert_eq!(order[first_repair + 1], "validate");
    }

    #[tokio::test]
    async fn test_jump_ceiling_refuses_the_51st_jump() {
        let dir = TempDir::new().unwrap();
        let mut toml = AnvilToml::default();
        toml.limits.max_jumps = 50;
        toml.limits.max_repair_attempts = 20;
        toml.limits.max_reimplementations = 10;
        let executor =
            ScriptedExecutor::new().always("validate", TaskOutcome::failure("still failing"));
        let engine = memory_engine(&dir, toml, &executor);

        let outcome = engine.run_plan(&Plan::new("ceiling")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Terminal);
        assert_eq!(
            outcome.fatal,
            Some(FatalCondition::JumpCeilingExceeded { ceiling: 50 })
        );
        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(snapshot.total_jumps, 50);
        assert_eq!(stage(&snapshot, "validate").status, StageStatus::Terminal);
        assert_eq!(stage(&snapshot, "quality").status, StageStatus::NotStarted);

        // 20 repairs, a reimplementation, 20 more, another, then 8.
        assert_eq!(executor.count("validate"), 51);
        assert_eq!(executor.count("repair"), 48);
        assert_eq!(executor.count("implement"), 3);
        assert_eq!(executor.count("quality"), 0);

        let history = engine.history(&outcome.workflow_id, 1).await.unwrap();
        let refused: Vec<(u32, u32)> = history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::JumpCeilingExceeded {
                    attempted, ceiling, ..
                } => Some((*attempted, *ceiling)),
                _ => None,
            })
            .collect();
        assert_eq!(refused, vec![(51, 50)]);
    }

    #[tokio::test]
    async fn test_setup_failure_is_terminal_without_retry() {
        let dir = TempDir::new().unwrap();
        let executor =
            ScriptedExecutor::new().always("setup", TaskOutcome::failure("npm ci exited 1"));
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&Plan::new("setup")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Terminal);
        assert!(matches!(
            outcome.fatal,
            Some(FatalCondition::SetupFailed { ref stage, .. }) if stage == "setup"
        ));
        assert_eq!(executor.count("setup"), 1);
        assert_eq!(executor.count("implement"), 0);
    }

    #[tokio::test]
    async fn test_agent_error_retries_in_place_then_gives_up() {
        let dir = TempDir::new().unwrap();
        let mut toml = AnvilToml::default();
        toml.limits.max_agent_retries = 2;
        let executor = ScriptedExecutor::new().erroring("implement");
        let engine = memory_engine(&dir, toml, &executor);

        let outcome = engine.run_plan(&Plan::new("retry")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Terminal);
        assert_eq!(executor.count("implement"), 3);
        assert_eq!(
            outcome.fatal,
            Some(FatalCondition::RetryExhausted {
                stage: "implement".into(),
                attempts: 2
            })
        );
    }

    #[tokio::test]
    async fn test_quality_retries_exhaust_into_failed_continue() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().script(
            "quality",
            [0.60, 0.62, 0.64, 0.66]
                .into_iter()
                .map(|v| TaskOutcome::scored(uniform_scores(v)))
                .collect(),
        );
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&Plan::new("quality")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::FailedContinue);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(executor.count("quality"), 4);
        assert_eq!(executor.count("repair"), 3);
        assert_eq!(executor.count("validate"), 4);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("'quality' accepted after exhausting")));

        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(stage(&snapshot, "quality").status, StageStatus::FailedContinue);
        assert_eq!(
            stage(&snapshot, "quality").counters.get(&CounterKind::QualityRetry),
            Some(&3)
        );
        assert!((snapshot.quality_total.unwrap() - 0.66).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unchanged_quality_is_accepted_early() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().script(
            "quality",
            vec![
                TaskOutcome::scored(uniform_scores(0.60)),
                TaskOutcome::scored(uniform_scores(0.60)),
            ],
        );
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&Plan::new("stagnant")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::FailedContinue);
        assert_eq!(executor.count("quality"), 2);
        assert_eq!(executor.count("repair"), 1);
        assert!(outcome.warnings.iter().any(|w| w.contains("unchanged")));
    }

    #[tokio::test]
    async fn test_reimplementations_exhaust_under_default_limits() {
        let dir = TempDir::new().unwrap();
        let executor =
            ScriptedExecutor::new().always("validate", TaskOutcome::failure("still failing"));
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&Plan::new("reimplement")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Terminal);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(
            outcome.fatal,
            Some(FatalCondition::ReimplementExhausted {
                stage: "validate".into(),
                attempts: 3
            })
        );
        // Five repairs per implementation, four implementations.
        assert_eq!(executor.count("repair"), 20);
        assert_eq!(executor.count("implement"), 4);
        assert_eq!(executor.count("validate"), 24);
        assert_eq!(executor.count("quality"), 0);

        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(snapshot.total_jumps, 23);
        assert_eq!(stage(&snapshot, "validate").status, StageStatus::Terminal);

        let history = engine.history(&outcome.workflow_id, 1).await.unwrap();
        assert_eq!(
            counter_values(&history, "validate", CounterKind::ReimplementationCount),
            vec![1, 2, 3]
        );
        assert_eq!(
            counter_values(&history, "validate", CounterKind::RepairAttempt),
            [1u32, 2, 3, 4, 5].repeat(4)
        );
    }

    #[tokio::test]
    async fn test_failed_review_sends_work_back_through_validation() {
        let dir = TempDir::new().unwrap();
        let mut toml = AnvilToml::default();
        toml.stages.review = true;
        let executor = ScriptedExecutor::new()
            .script("review", vec![TaskOutcome::failure("unchecked unwrap in parser")]);
        let engine = memory_engine(&dir, toml, &executor);

        let outcome = engine.run_plan(&Plan::new("review")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        let order = executor.call_order();
        assert_eq!(
            order[order.len() - 6..],
            ["validate", "review", "repair", "validate", "review", "quality"]
        );
        let repair = executor
            .calls()
            .into_iter()
            .find(|c| c.stage_id == "repair")
            .unwrap();
        assert!(repair.feedback.iter().any(|f| f.contains("unchecked unwrap")));
    }

    #[tokio::test]
    async fn test_surviving_mutants_are_accepted_with_a_warning() {
        let dir = TempDir::new().unwrap();
        let mut toml = AnvilToml::default();
        toml.stages.mutation = true;
        let executor = ScriptedExecutor::new()
            .always("mutation", TaskOutcome::failure("3 mutants survived"));
        let engine = memory_engine(&dir, toml, &executor);

        let outcome = engine.run_plan(&Plan::new("mutation")).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::FailedContinue);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(executor.count("mutation"), 1);
        assert_eq!(executor.count("repair"), 0);
        assert_eq!(executor.count("quality"), 1);
        assert!(outcome.warnings.iter().any(|w| w.contains("mutants survived")));
    }
}

mod parallel {
    use super::*;

    #[tokio::test]
    async fn test_dependent_module_waits_for_its_dependency() {
        let dir = TempDir::new().unwrap();
        let plan = Plan::new("deps").with_modules(vec![
            ModuleSpec::new("core").with_files(&["src/core.rs"]),
            ModuleSpec::new("api")
                .with_files(&["src/api.rs"])
                .with_deps(&["core"]),
        ]);
        let executor = ScriptedExecutor::new();
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&plan).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Succeeded);

        let order = executor.call_order();
        assert!(position(&order, "setup") < position(&order, "write_tests_core"));
        assert!(position(&order, "validate_core") < position(&order, "write_tests_api"));
        assert!(position(&order, "validate_api") < position(&order, "integration_validate"));
        assert!(position(&order, "integration_validate") < position(&order, "quality"));
    }

    #[tokio::test]
    async fn test_overlapping_ownership_is_rejected_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let plan = Plan::new("overlap").with_modules(vec![
            ModuleSpec::new("a").with_files(&["src/shared.rs", "src/a.rs"]),
            ModuleSpec::new("b").with_files(&["./src/shared.rs"]),
        ]);
        let executor = ScriptedExecutor::new();
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let err = engine.run_plan(&plan).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Plan(PlanError::OwnershipConflict { .. })
        ));
        assert!(executor.calls().is_empty());
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_module_repairs_twice_while_siblings_succeed() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().script(
            "validate_b",
            vec![
                TaskOutcome::failure("b tests failing"),
                TaskOutcome::failure("b tests failing"),
            ],
        );
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&modules(&["a", "b", "c"])).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(executor.count("validate_b"), 3);
        assert_eq!(executor.count("repair_b"), 2);
        assert_eq!(executor.count("repair_a"), 0);
        assert_eq!(executor.count("repair_c"), 0);
        assert_eq!(executor.count("integration_validate"), 1);

        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(snapshot.total_jumps, 2);
        assert_eq!(
            stage(&snapshot, "validate_b").counters.get(&CounterKind::RepairAttempt),
            Some(&2)
        );
        for scope in ["pre", "module:a", "module:b", "module:c", "integration"] {
            assert_eq!(snapshot.scopes[scope], WorkflowStatus::Succeeded, "{}", scope);
        }

        // Repair tasks only see the failing module's files.
        let repair = executor
            .calls()
            .into_iter()
            .find(|c| c.stage_id == "repair_b")
            .unwrap();
        assert_eq!(repair.owned_files, vec!["src/b.rs"]);
        assert!(repair.feedback.iter().any(|f| f.contains("b tests failing")));
    }

    #[tokio::test]
    async fn test_module_ceiling_stops_integration() {
        let dir = TempDir::new().unwrap();
        let mut toml = AnvilToml::default();
        toml.limits.per_module_max_jumps = 3;
        let executor =
            ScriptedExecutor::new().always("validate_b", TaskOutcome::failure("never passes"));
        let engine = memory_engine(&dir, toml, &executor);

        let outcome = engine.run_plan(&modules(&["a", "b"])).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Terminal);
        assert_eq!(executor.count("repair_b"), 3);
        assert_eq!(executor.count("integration_validate"), 0);

        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(snapshot.scopes["module:a"], WorkflowStatus::Succeeded);
        assert_eq!(snapshot.scopes["module:b"], WorkflowStatus::Terminal);
        assert_eq!(snapshot.scopes["integration"], WorkflowStatus::Terminal);
    }

    #[tokio::test]
    async fn test_low_quality_jumps_to_integration_repair() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().script(
            "quality",
            vec![
                TaskOutcome::scored(uniform_scores(0.78)),
                TaskOutcome::scored(uniform_scores(0.90)),
            ],
        );
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&modules(&["a", "b"])).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(executor.count("quality"), 2);
        assert_eq!(executor.count("integration_repair"), 1);
        assert_eq!(executor.count("integration_validate"), 2);
        let order = executor.call_order();
        assert_eq!(
            order[order.len() - 3..],
            ["integration_repair", "integration_validate", "quality"]
        );

        let history = engine.history(&outcome.workflow_id, 1).await.unwrap();
        let jump = history
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::JumpTaken {
                    target, counter, ..
                } if e.stage() == Some("quality") => Some((target.clone(), *counter)),
                _ => None,
            })
            .unwrap();
        assert_eq!(jump, ("integration_repair".to_string(), CounterKind::QualityRetry));

        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert!((snapshot.quality_total.unwrap() - 0.90).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_integration_repairs_exhaust_and_quality_still_runs() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new()
            .always("integration_validate", TaskOutcome::failure("cross-module tests fail"));
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);

        let outcome = engine.run_plan(&modules(&["a", "b"])).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::FailedContinue);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(executor.count("integration_repair"), 3);
        assert_eq!(executor.count("integration_validate"), 4);
        assert_eq!(executor.count("quality"), 1);

        let snapshot = engine.status(&outcome.workflow_id).await.unwrap();
        assert_eq!(
            stage(&snapshot, "integration_validate").status,
            StageStatus::FailedContinue
        );
        assert_eq!(stage(&snapshot, "quality").status, StageStatus::Succeeded);
        assert_eq!(snapshot.scopes["integration"], WorkflowStatus::FailedContinue);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_modules_in_a_wave_progress_independently() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().hang("implement_a").script(
            "validate_b",
            vec![
                TaskOutcome::failure("b tests failing"),
                TaskOutcome::failure("b tests failing"),
            ],
        );
        let engine = Arc::new(memory_engine(&dir, AnvilToml::default(), &executor));
        let id = engine.create_workflow(&modules(&["a", "b"])).await.unwrap();

        let run = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.start(&id).await })
        };
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let snapshot = engine.status(&id).await.unwrap();
                if snapshot.scopes["module:b"] == WorkflowStatus::Succeeded {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("module b finished while module a was blocked");

        // b repaired twice while a's implementation never returned.
        let snapshot = engine.status(&id).await.unwrap();
        assert_eq!(stage(&snapshot, "implement_a").status, StageStatus::Running);
        assert_eq!(executor.count("implement_a"), 1);
        assert_eq!(executor.count("validate_b"), 3);
        assert_eq!(executor.count("repair_b"), 2);
        assert_eq!(executor.count("integration_validate"), 0);

        engine.cancel(&id).await.unwrap();
        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Canceled);
        assert_eq!(executor.count("integration_validate"), 0);
    }
}

mod durability {
    use super::*;

    #[tokio::test]
    async fn test_replayed_log_matches_live_stream() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().script(
            "validate",
            vec![TaskOutcome::failure("flaky"), TaskOutcome::failure("flaky")],
        );
        let engine = sqlite_engine(&dir, &executor);
        let mut live = engine.subscribe(SubscriptionFilter::all());

        let outcome = engine.run_plan(&Plan::new("replay")).await.unwrap();
        engine.bus().shutdown();
        let mut streamed = Vec::new();
        while let Some(event) = live.recv().await {
            streamed.push(event);
        }
        drop(engine);

        // A fresh process sees exactly what subscribers saw.
        let reopened = sqlite_engine(&dir, &ScriptedExecutor::new());
        let persisted = reopened.history(&outcome.workflow_id, 1).await.unwrap();
        assert_eq!(persisted, streamed);
        let seqs: Vec<u64> = persisted.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=persisted.len() as u64).collect::<Vec<_>>());

        let replayed = WorkflowState::replay(&persisted).unwrap().snapshot();
        assert_eq!(replayed, reopened.status(&outcome.workflow_id).await.unwrap());
        assert_eq!(replayed.status, outcome.status);
        assert_eq!(replayed.fatal, outcome.fatal);
        assert_eq!(replayed.total_jumps, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupted_stage_reruns_once_after_recovery() {
        let dir = TempDir::new().unwrap();
        let first = ScriptedExecutor::new().hang("implement_b");
        let engine = Arc::new(sqlite_engine(&dir, &first));
        let id = engine.create_workflow(&modules(&["a", "b"])).await.unwrap();

        let run = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.start(&id).await })
        };
        first.wait_for("implement_b", 1).await;
        loop {
            let snapshot = engine.status(&id).await.unwrap();
            if snapshot.scopes["module:a"] == WorkflowStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Simulated crash: the driving task disappears mid-stage.
        run.abort();
        let _ = run.await;
        drop(engine);

        let second = ScriptedExecutor::new();
        let engine = sqlite_engine(&dir, &second);
        let before = engine.status(&id).await.unwrap();
        assert_eq!(stage(&before, "implement_b").status, StageStatus::Running);

        let reports = engine.recover().await.unwrap();
        let report = reports.iter().find(|r| r.workflow_id == id).unwrap();
        assert_eq!(report.reset, vec!["implement_b"]);

        let outcome = engine.start(&id).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(second.count("implement_b"), 1);
        for done in before.stages.iter().filter(|s| s.status == StageStatus::Succeeded) {
            assert_eq!(second.count(&done.id), 0, "{} ran again", done.id);
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().hang("implement");
        let engine = Arc::new(memory_engine(&dir, AnvilToml::default(), &executor));
        let id = engine.create_workflow(&Plan::new("cancel")).await.unwrap();

        let run = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.start(&id).await })
        };
        executor.wait_for("implement", 1).await;
        engine.cancel(&id).await.unwrap();
        let outcome = run.await.unwrap().unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Canceled);
        assert_eq!(outcome.exit_code(), 130);
        let snapshot = engine.status(&id).await.unwrap();
        assert_eq!(stage(&snapshot, "implement").status, StageStatus::Canceled);
        assert_eq!(stage(&snapshot, "validate").status, StageStatus::Canceled);
        assert_eq!(executor.count("validate"), 0);

        let history = engine.history(&id, 1).await.unwrap();
        let canceled_at = history
            .iter()
            .position(|e| {
                matches!(
                    e.kind,
                    EventKind::WorkflowStatusChanged {
                        status: WorkflowStatus::Canceled,
                        ..
                    }
                )
            })
            .unwrap();
        assert!(history[canceled_at..]
            .iter()
            .all(|e| !matches!(e.kind, EventKind::StageStarted { .. })));

        assert!(matches!(
            engine.start(&id).await,
            Err(EngineError::NotResumable { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_idle_workflow() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new();
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);
        let id = engine.create_workflow(&Plan::new("idle")).await.unwrap();

        engine.cancel(&id).await.unwrap();

        let snapshot = engine.status(&id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Canceled);
        assert!(engine.latest_resumable().await.unwrap().is_none());
        assert!(matches!(
            engine.cancel("missing").await,
            Err(EngineError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_subscriber_does_not_hold_back_others() {
        let dir = TempDir::new().unwrap();
        let mut toml = AnvilToml::default();
        toml.limits.max_repair_attempts = 20;
        let executor = ScriptedExecutor::new().script(
            "validate",
            (0..15).map(|_| TaskOutcome::failure("again")).collect(),
        );
        let engine = Engine::new(
            config(&dir, toml),
            Arc::new(MemoryEventLog::new()),
            EventBus::new(16),
            Executors::uniform(Arc::new(executor.clone())),
        );

        let mut slow = engine.subscribe(SubscriptionFilter::all());
        let mut fast = engine.subscribe(SubscriptionFilter::all());
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = fast.recv().await {
                seen.push(event.seq);
            }
            seen
        });

        let outcome = engine.run_plan(&Plan::new("fanout")).await.unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        engine.bus().shutdown();

        let history = engine.history(&outcome.workflow_id, 1).await.unwrap();
        let seen = collector.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        let mut slow_seen = 0;
        while slow.try_recv().is_some() {
            slow_seen += 1;
        }
        assert!(slow.dropped() > 0);
        assert!(slow_seen < history.len());
        // The log never loses anything.
        assert_eq!(history.len() as u64, history.last().unwrap().seq);
    }

    #[tokio::test]
    async fn test_archived_workflow_is_not_resumed() {
        let dir = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new();
        let engine = memory_engine(&dir, AnvilToml::default(), &executor);
        let id = engine.create_workflow(&Plan::new("archive")).await.unwrap();
        assert_eq!(engine.latest_resumable().await.unwrap(), Some(id.clone()));

        engine.archive(&id).await.unwrap();

        assert!(engine.latest_resumable().await.unwrap().is_none());
        assert!(engine.resume_latest().await.unwrap().is_none());
        assert!(executor.calls().is_empty());
    }
}
