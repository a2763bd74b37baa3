//! Integration tests against SQLite files and on-disk artifacts
//!
//! Tests the durable paths: snapshot round-trips, snapshots surviving a restart, and the
//! response cache warming a fresh orchestrator from disk.

use flowprobe::config::HarnessConfig;
use flowprobe::environment::DbMode;
use flowprobe::orchestrator::{ExecutionConfig, LlmCallOptions, Orchestrator};
use flowprobe::scenario::{parse_scenario_file, ScenarioRunner};
use flowprobe::store::Filters;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Configuration rooted in a temporary directory
fn setup_config() -> (TempDir, HarnessConfig) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    let mut config = HarnessConfig::for_tests();
    config.database.production_path = root.join("production.db");
    config.database.test_path = root.join("test.db");
    config.database.snapshot_directory = root.join("snapshots");
    config.llm_cache.directory = root.join("cache");
    config.llm_cache.persist = true;
    config.scenarios.directory = root.join("scenarios");
    (temp_dir, config)
}

#[test]
fn test_snapshot_restores_exact_rows() {
    let (_temp_dir, config) = setup_config();
    let orch = Orchestrator::from_config(config).unwrap();
    let env = orch.environment();
    let client = env.raw_client();

    client.insert("projects", &[json!({"id": 1})]).unwrap();
    let id = env.create_snapshot("s1", None).unwrap();

    client.insert("projects", &[json!({"id": 2})]).unwrap();
    client
        .insert("artifacts", &[json!({"id": "a", "kind": "report"})])
        .unwrap();

    env.restore_snapshot(&id).unwrap();
    assert_eq!(
        client.select("projects", &Filters::new()).unwrap(),
        vec![json!({"id": 1})]
    );
    assert!(client.select("artifacts", &Filters::new()).unwrap().is_empty());
}

#[test]
fn test_snapshots_survive_restart() {
    let (_temp_dir, config) = setup_config();

    let id = {
        let orch = Orchestrator::from_config(config.clone()).unwrap();
        let env = orch.environment();
        env.raw_client()
            .insert("projects", &[json!({"id": 7, "name": "seeded"})])
            .unwrap();
        env.create_snapshot("clean_state", Some("baseline"))
            .unwrap()
    };

    let orch = Orchestrator::from_config(config).unwrap();
    let env = orch.environment();
    assert_eq!(env.mode(), DbMode::Test);

    let listed = env.list_snapshots();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].metadata.row_count, 1);

    env.clear_all_tables().unwrap();
    env.reset_to_clean_state().unwrap();
    assert_eq!(env.count("projects", &Filters::new()).unwrap(), 1);

    assert!(env.delete_snapshot(&id).unwrap());
    assert!(env.list_snapshots().is_empty());
}

#[test]
fn test_modes_use_separate_files() {
    let (_temp_dir, config) = setup_config();
    let orch = Orchestrator::from_config(config).unwrap();
    let env = orch.environment();

    env.raw_client()
        .insert("projects", &[json!({"id": "test-row"})])
        .unwrap();
    env.switch_mode(DbMode::Production).unwrap();
    assert_eq!(env.count("projects", &Filters::new()).unwrap(), 0);

    env.switch_mode(DbMode::Test).unwrap();
    assert_eq!(env.count("projects", &Filters::new()).unwrap(), 1);
}

#[test]
fn test_fresh_process_metrics_report_persisted_state() {
    let (_temp_dir, config) = setup_config();
    {
        let orch = Orchestrator::from_config(config.clone()).unwrap();
        orch.cache()
            .set("support", "classify", "Classify", json!("billing"), None, None, None);
        orch.environment().create_snapshot("baseline", None).unwrap();
    }

    let orch = Orchestrator::from_config(config).unwrap();
    let text = orch.metrics().render().unwrap();
    assert!(text.contains("flowprobe_cache_entries 1"), "{}", text);
    assert!(text.contains("flowprobe_snapshots 1"), "{}", text);
}

#[tokio::test]
async fn test_cache_warms_from_disk() {
    let (_temp_dir, config) = setup_config();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        // Fresh orchestrator each time: the second run can only hit through the files.
        let orch = Orchestrator::from_config(config.clone()).unwrap();
        let calls = calls.clone();
        let outcome = orch
            .execute(ExecutionConfig::new("support"), |ctx| async move {
                ctx.execute_llm_call(
                    "summarize",
                    "Summarize the ticket",
                    LlmCallOptions {
                        model: Some("gpt-4o-mini".to_string()),
                        temperature: Some(0.2),
                        ..Default::default()
                    },
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"summary": "customer wants a refund"}))
                    },
                )
                .await
            })
            .await
            .unwrap();
        assert_eq!(
            outcome.result,
            Some(Some(json!({"summary": "customer wants a refund"})))
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scenario_file_runs_against_snapshot() {
    let (temp_dir, config) = setup_config();
    let orch = Arc::new(Orchestrator::from_config(config).unwrap());
    let snapshot_id = {
        let env = orch.environment();
        env.raw_client()
            .insert("projects", &[json!({"id": 1, "status": "new"})])
            .unwrap();
        env.create_snapshot("one-project", None).unwrap()
    };

    let path = temp_dir.path().join("triage.yaml");
    std::fs::write(
        &path,
        format!(
            r#"
id: triage
name: Triage a new project
workflow_name: triage
initial_database_state: "{snapshot_id}"
expected_llm_responses:
  classify: "priority: high"
assertions:
  - id: output
    type: output_contains
    condition: "priority: high"
  - id: rows
    type: database_state
    condition:
      table: projects
      count: 1
"#
        ),
    )
    .unwrap();
    assert_eq!(parse_scenario_file(&path).unwrap().len(), 1);

    let runner = ScenarioRunner::new(orch.clone());
    assert_eq!(runner.load_scenario_file(&path).unwrap(), vec!["triage"]);

    // Leftover rows from an earlier run must not leak into the scenario.
    orch.environment()
        .raw_client()
        .insert("projects", &[json!({"id": 2})])
        .unwrap();

    let result = runner
        .run_scenario("triage", |ctx| async move {
            ctx.execute_llm_call(
                "classify",
                "Classify project 1",
                LlmCallOptions::default(),
                || async { Ok(json!("priority: low")) },
            )
            .await
        })
        .await
        .unwrap();

    assert!(result.success, "{:?} {:?}", result.error, result.failures);
}
