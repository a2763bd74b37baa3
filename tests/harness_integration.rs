//! End-to-end tests of the orchestrator and scenario runner on the wall clock
//!
//! Covers: error containment, cache reuse across executions, replay, comparison and
//! scenario batches running concurrently against one orchestrator.

use flowprobe::clock::system_clock;
use flowprobe::config::HarnessConfig;
use flowprobe::models::{ExecutionStatus, StepType};
use flowprobe::orchestrator::{
    DifferenceKind, ExecutionConfig, ExecutionOutcome, LlmCallOptions, Orchestrator, ReplayConfig,
};
use flowprobe::scenario::{
    Assertion, AssertionType, RunOptions, ScenarioRunner, TestScenario,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator() -> Arc<Orchestrator> {
    Arc::new(Orchestrator::in_memory(HarnessConfig::for_tests(), system_clock()).unwrap())
}

fn scenario(id: &str, assertions: Vec<Assertion>) -> TestScenario {
    TestScenario {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        workflow_name: "support".to_string(),
        initial_database_state: None,
        expected_llm_responses: BTreeMap::new(),
        breakpoints: Vec::new(),
        assertions,
        expected_final_state: None,
        tags: vec!["integration".to_string()],
        timeout_ms: None,
    }
}

fn assertion(id: &str, assertion_type: AssertionType, condition: Value) -> Assertion {
    Assertion {
        id: id.to_string(),
        step: None,
        assertion_type,
        condition,
        description: String::new(),
    }
}

#[tokio::test]
async fn test_failing_workflow_never_escapes_execute() {
    let orch = orchestrator();

    let outcome: ExecutionOutcome<Value> = orch
        .execute(ExecutionConfig::new("x"), |_ctx| async {
            Err(anyhow::anyhow!("boom"))
        })
        .await
        .unwrap();

    assert!(outcome.result.is_none());
    assert_eq!(outcome.error.as_ref().unwrap().message, "boom");
    let execution = outcome.execution.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.end_time.is_some());
    assert!(orch.ledger().active_executions().is_empty());
}

#[tokio::test]
async fn test_multi_step_workflow_reuses_cache_and_compares() {
    let orch = orchestrator();
    let llm_calls = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for _ in 0..2 {
        let llm_calls = llm_calls.clone();
        let outcome = orch
            .execute(ExecutionConfig::new("support").with_test_db(true), |ctx| async move {
                let ticket = ctx
                    .execute_step("load_ticket", StepType::ToolExecution, None, |_| async {
                        Ok(json!({"subject": "Refund request"}))
                    })
                    .await?
                    .unwrap_or(Value::Null);

                let label: Option<Value> = ctx
                    .execute_llm_call(
                        "classify",
                        &format!("Classify: {}", ticket["subject"]),
                        LlmCallOptions::default(),
                        || async move {
                            llm_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(json!({"label": "billing"}))
                        },
                    )
                    .await?;

                ctx.execute_with_database("store_label", |client| async move {
                    Ok(client.insert("analyses", &[json!({"label": label})])?)
                })
                .await
            })
            .await
            .unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.error);
        ids.push(outcome.execution_id);
    }

    assert_eq!(llm_calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.environment().count("analyses", &Default::default()).unwrap(), 2);

    let comparison = orch.compare_executions(&ids[0], &ids[1]).unwrap();
    assert!(comparison
        .differences
        .iter()
        .all(|d| d.kind != DifferenceKind::MissingStep && d.kind != DifferenceKind::Status));
}

#[tokio::test]
async fn test_replay_serves_recorded_responses() {
    let orch = orchestrator();
    let original = orch
        .execute(ExecutionConfig::new("support").with_cache(false), |ctx| async move {
            ctx.execute_llm_call("draft", "Draft a reply", LlmCallOptions::default(), || async {
                Ok(json!("Thanks for reaching out"))
            })
            .await
        })
        .await
        .unwrap();

    let replay = ReplayConfig {
        use_recorded_responses: true,
        ..Default::default()
    };
    let replayed = orch
        .replay(&original.execution_id, replay, |ctx| async move {
            ctx.execute_llm_call("draft", "Draft a reply", LlmCallOptions::default(), || async {
                Ok(json!("a different live answer"))
            })
            .await
        })
        .await
        .unwrap();

    assert_eq!(replayed.result, Some(Some(json!("Thanks for reaching out"))));
    let execution = replayed.execution.unwrap();
    assert_eq!(execution.trigger, "replay");
    assert_eq!(
        execution.parent_execution_id.as_deref(),
        Some(original.execution_id.as_str())
    );
    assert!(execution.llm_calls[0].cache_hit);
}

#[tokio::test]
async fn test_slow_workflow_fails_duration_assertion() {
    let runner = ScenarioRunner::new(orchestrator());
    runner
        .register_scenario(scenario(
            "slow",
            vec![assertion("fast", AssertionType::DurationUnder, json!(5))],
        ))
        .unwrap();

    let result = runner
        .run_scenario("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].expected, "Duration under 5ms");
}

#[tokio::test]
async fn test_parallel_scenarios_keep_steps_apart() {
    let runner = ScenarioRunner::new(orchestrator());
    let ids: Vec<String> = (0..4).map(|i| format!("parallel-{}", i)).collect();
    for id in &ids {
        runner
            .register_scenario(scenario(
                id,
                vec![assertion(
                    "llm",
                    AssertionType::LlmCallMade,
                    json!({"step": "classify"}),
                )],
            ))
            .unwrap();
    }

    let results = runner
        .run_multiple_scenarios(
            &ids,
            RunOptions {
                parallel: true,
                continue_on_failure: true,
            },
            |ctx| async move {
                let id = ctx.execution_id().to_string();
                ctx.execute_step("prepare", StepType::ToolExecution, None, |_| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                })
                .await?;
                ctx.execute_llm_call(
                    "classify",
                    &format!("Classify {}", id),
                    LlmCallOptions::default(),
                    || async { Ok(json!("ok")) },
                )
                .await
            },
        )
        .await;

    assert_eq!(results.len(), 4);
    for result in &results {
        assert!(result.success, "{}: {:?}", result.scenario_id, result.failures);
        let execution = result.execution.as_ref().unwrap();
        assert_eq!(execution.steps.len(), 2);
        assert_eq!(execution.llm_calls.len(), 1);
        let classify = execution.step_named("classify").unwrap();
        assert_eq!(execution.llm_calls[0].step_id, classify.id);
        assert!(execution.llm_calls[0].prompt.ends_with(execution.id.as_str()));
    }

    let report = runner.generate_report(None);
    assert_eq!(report.total, 4);
    assert_eq!(report.passed, 4);
    assert!(report.render().contains("4 passed"));
}

async fn classify_live(orch: &Orchestrator, prompt: &'static str) -> Option<Value> {
    orch.execute(ExecutionConfig::new("support").with_cache(false), |ctx| async move {
        ctx.execute_llm_call(
            "classify",
            prompt,
            LlmCallOptions {
                model: Some("gpt-4o".to_string()),
                temperature: Some(0.9),
                ..Default::default()
            },
            || async { Ok(json!("live")) },
        )
        .await
    })
    .await
    .unwrap()
    .result
    .flatten()
}

#[tokio::test]
async fn test_seeds_and_replay_pins_end_with_their_run() {
    let orch = orchestrator();
    let runner = ScenarioRunner::new(orch.clone());
    let mut seeded = scenario(
        "seeded",
        vec![assertion("out", AssertionType::OutputContains, json!("seeded"))],
    );
    seeded
        .expected_llm_responses
        .insert("classify".to_string(), json!("seeded"));
    runner.register_scenario(seeded).unwrap();

    let result = runner
        .run_scenario("seeded", |ctx| async move {
            ctx.execute_llm_call("classify", "scenario prompt", LlmCallOptions::default(), || async {
                Ok(json!("live"))
            })
            .await
        })
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.failures);
    assert_eq!(classify_live(&orch, "a totally different prompt").await, Some(json!("live")));

    let recorded = orch
        .execute(ExecutionConfig::new("support").with_cache(false), |ctx| async move {
            ctx.execute_llm_call("classify", "recorded prompt", LlmCallOptions::default(), || async {
                Ok(json!("recorded"))
            })
            .await
        })
        .await
        .unwrap();
    let replay = ReplayConfig {
        use_recorded_responses: true,
        ..Default::default()
    };
    let replayed = orch
        .replay(&recorded.execution_id, replay, |ctx| async move {
            ctx.execute_llm_call("classify", "recorded prompt", LlmCallOptions::default(), || async {
                Ok(json!("live"))
            })
            .await
        })
        .await
        .unwrap();
    assert_eq!(replayed.result, Some(Some(json!("recorded"))));
    assert_eq!(classify_live(&orch, "recorded prompt").await, Some(json!("live")));

    let cache = orch.cache();
    assert_eq!(cache.get("support", "classify", "zzz", Some("m"), Some(0.9)), None);
    assert_eq!(cache.get("support", "classify", "scenario prompt", None, None), None);
}

#[tokio::test]
async fn test_step_override_respects_model_and_temperature() {
    let orch = orchestrator();
    let cache = orch.cache();
    cache.set_step_override(
        "support",
        "classify",
        "manual:classify",
        json!("pinned"),
        Some("gpt-4o-mini"),
        Some(0.2),
    );

    assert_eq!(
        cache.get("support", "classify", "any prompt", Some("gpt-4o-mini"), Some(0.2)),
        Some(json!("pinned"))
    );
    assert_eq!(cache.get("support", "classify", "any prompt", Some("gpt-4o"), Some(0.2)), None);
    assert_eq!(
        cache.get("support", "classify", "any prompt", Some("gpt-4o-mini"), Some(0.7)),
        None
    );
    assert_eq!(cache.get("support", "classify", "any prompt", None, None), None);
}
