//! Scenario runner
//!
//! A scenario is a declarative test case: an initial database snapshot, pre-seeded LLM
//! responses and assertions checked against the finished execution. Each run goes
//! through setup, execute, assert and report; nothing that happens inside a run
//! (workflow errors, timeouts, failing or broken assertions) escapes as an error.
//!
//! # Example scenario (YAML)
//!
//! ```yaml
//! id: campaign-basic
//! name: Basic campaign analysis
//! workflow_name: campaign-analysis
//! expected_llm_responses:
//!   classify: { "label": "retail" }
//! assertions:
//!   - id: label
//!     type: output_contains
//!     condition: retail
//!   - id: fast
//!     type: duration_under
//!     condition: 5000
//! ```

use crate::clock::elapsed_ms;
use crate::environment::DbMode;
use crate::error::{FlowProbeError, Result};
use crate::models::{ErrorDetail, Execution};
use crate::orchestrator::{BreakpointHandler, ExecutionConfig, Orchestrator, WorkflowContext};
use crate::store::Filters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest `actual` value kept in a failure record
const ACTUAL_PREVIEW_LEN: usize = 200;

/// Kind of check an assertion performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    /// Serialized workflow output contains `condition`
    OutputContains,
    /// Row count of `condition.table` filtered by `condition.where` equals `condition.count`
    DatabaseState,
    /// At least one LLM call matches `condition.provider` / `model` / `step`
    LlmCallMade,
    /// Total duration is strictly below `condition` milliseconds
    DurationUnder,
    /// Registered predicate named by `condition` passes
    Custom,
}

impl std::fmt::Display for AssertionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssertionType::OutputContains => "output_contains",
            AssertionType::DatabaseState => "database_state",
            AssertionType::LlmCallMade => "llm_call_made",
            AssertionType::DurationUnder => "duration_under",
            AssertionType::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assertion {
    pub id: String,
    /// Step the assertion is about; also the default step filter of `llm_call_made`
    #[serde(default)]
    pub step: Option<String>,
    #[serde(rename = "type")]
    pub assertion_type: AssertionType,
    #[serde(default)]
    pub condition: Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestScenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workflow_name: String,
    /// Snapshot restored before the run; without one the environment is reset
    #[serde(default)]
    pub initial_database_state: Option<String>,
    /// Step name -> response served for any prompt of that step
    #[serde(default)]
    pub expected_llm_responses: BTreeMap<String, Value>,
    #[serde(default)]
    pub breakpoints: Vec<String>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub expected_final_state: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Overrides `scenarios.timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TestScenario {
    /// Check the definition is internally consistent
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FlowProbeError::InvalidScenario(msg));
        if self.id.trim().is_empty() {
            return invalid("scenario id is empty".to_string());
        }
        if self.workflow_name.trim().is_empty() {
            return invalid(format!("{}: workflow_name is empty", self.id));
        }

        let mut seen = HashSet::new();
        for a in &self.assertions {
            if !seen.insert(a.id.as_str()) {
                return invalid(format!("{}: duplicate assertion id '{}'", self.id, a.id));
            }
            match a.assertion_type {
                AssertionType::DurationUnder if a.condition.as_u64().is_none() => {
                    return invalid(format!(
                        "{}: assertion '{}' needs a millisecond bound",
                        self.id, a.id
                    ));
                }
                AssertionType::DatabaseState
                    if a.condition.get("table").and_then(Value::as_str).is_none() =>
                {
                    return invalid(format!(
                        "{}: assertion '{}' needs condition.table",
                        self.id, a.id
                    ));
                }
                AssertionType::Custom if custom_name(&a.condition).is_none() => {
                    return invalid(format!(
                        "{}: assertion '{}' needs a predicate name",
                        self.id, a.id
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn custom_name(condition: &Value) -> Option<&str> {
    condition
        .as_str()
        .or_else(|| condition.get("name").and_then(Value::as_str))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionFailure {
    pub assertion_id: String,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioResult {
    pub scenario_id: String,
    pub scenario_name: String,
    pub execution: Option<Execution>,
    pub success: bool,
    pub failures: Vec<AssertionFailure>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Workflow error, timeout or setup failure
    pub error: Option<String>,
}

/// Predicate behind a `custom` assertion: `(execution, workflow output)`
pub type CustomPredicate = Arc<dyn Fn(&Execution, &Value) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Start every scenario at once
    pub parallel: bool,
    /// Keep going after a failed scenario when running sequentially
    pub continue_on_failure: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            continue_on_failure: true,
        }
    }
}

/// Aggregate over recorded scenario results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    pub fn from_results(results: Vec<ScenarioResult>) -> Self {
        let passed = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            total_duration_ms: results.iter().map(|r| r.duration_ms).sum(),
            results,
        }
    }

    /// Console rendering with failing assertion detail
    pub fn render(&self) -> String {
        let mut out = format!(
            "Scenarios: {} total, {} passed, {} failed ({}ms)\n",
            self.total, self.passed, self.failed, self.total_duration_ms
        );
        for r in &self.results {
            let mark = if r.success { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "  {} {} - {} ({}ms)\n",
                mark, r.scenario_id, r.scenario_name, r.duration_ms
            ));
            if let Some(error) = &r.error {
                out.push_str(&format!("      error: {}\n", error));
            }
            for f in &r.failures {
                out.push_str(&format!(
                    "      [{}] {}\n        expected: {}\n        actual:   {}\n",
                    f.assertion_id, f.message, f.expected, f.actual
                ));
            }
        }
        out
    }
}

fn preview(s: String) -> String {
    if s.len() <= ACTUAL_PREVIEW_LEN {
        return s;
    }
    let mut end = ACTUAL_PREVIEW_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Loads, runs and reports test scenarios against an orchestrator
pub struct ScenarioRunner {
    orchestrator: Arc<Orchestrator>,
    default_timeout_ms: u64,
    scenarios: RwLock<BTreeMap<String, TestScenario>>,
    predicates: RwLock<HashMap<String, CustomPredicate>>,
    breakpoint_handler: RwLock<Option<Arc<dyn BreakpointHandler>>>,
    results: Mutex<Vec<ScenarioResult>>,
}

impl ScenarioRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let default_timeout_ms = orchestrator.config().scenarios.timeout_ms;
        Self {
            orchestrator,
            default_timeout_ms,
            scenarios: RwLock::new(BTreeMap::new()),
            predicates: RwLock::new(HashMap::new()),
            breakpoint_handler: RwLock::new(None),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Add or replace a scenario
    pub fn register_scenario(&self, scenario: TestScenario) -> Result<()> {
        scenario.validate()?;
        self.scenarios
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scenario.id.clone(), scenario);
        Ok(())
    }

    pub fn scenario(&self, id: &str) -> Option<TestScenario> {
        self.scenarios
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Registered scenarios ordered by id
    pub fn scenarios(&self) -> Vec<TestScenario> {
        self.scenarios
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Register the predicate behind `custom` assertions naming `name`
    pub fn register_custom_assertion<F>(&self, name: &str, predicate: F)
    where
        F: Fn(&Execution, &Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.predicates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(predicate));
    }

    /// Handler consulted at scenario breakpoints
    pub fn set_breakpoint_handler(&self, handler: Arc<dyn BreakpointHandler>) {
        *self
            .breakpoint_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Load and register every scenario in a JSON or YAML file
    ///
    /// A file holds either one scenario or a list of them.
    pub fn load_scenario_file(&self, path: &Path) -> Result<Vec<String>> {
        let scenarios = parse_scenario_file(path)?;
        let mut ids = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            ids.push(scenario.id.clone());
            self.register_scenario(scenario)?;
        }
        info!(path = %path.display(), count = ids.len(), "Scenarios loaded");
        Ok(ids)
    }

    /// Load every `.json`, `.yaml` and `.yml` file of a directory; bad files are skipped
    pub fn load_scenarios_dir(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_scenario_file(p))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.load_scenario_file(&path) {
                Ok(ids) => loaded += ids.len(),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping scenario file"),
            }
        }
        Ok(loaded)
    }

    fn setup(&self, scenario: &TestScenario) -> Result<()> {
        let env = self.orchestrator.environment();
        env.switch_mode(DbMode::Test)?;
        match &scenario.initial_database_state {
            Some(snapshot_id) => env.restore_snapshot(snapshot_id)?,
            None => env.reset_to_clean_state()?,
        }
        Ok(())
    }

    /// Run one registered scenario against `workflow`
    ///
    /// `Err` only when the scenario id is unknown; everything else lands in the result.
    pub async fn run_scenario<T, F, Fut>(&self, id: &str, workflow: F) -> Result<ScenarioResult>
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let scenario = self
            .scenario(id)
            .ok_or_else(|| FlowProbeError::ScenarioNotFound(id.to_string()))?;
        let clock = self.orchestrator.clock().clone();
        let started_at = clock.now();
        info!(scenario = %scenario.id, workflow = %scenario.workflow_name, "Running scenario");

        let mut result = ScenarioResult {
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            execution: None,
            success: false,
            failures: Vec::new(),
            started_at,
            duration_ms: 0,
            error: None,
        };

        if let Err(e) = self.setup(&scenario) {
            result.error = Some(format!("Setup failed: {}", e));
        } else {
            let output = self.execute(&scenario, workflow, &mut result).await;
            if result.execution.is_some() || result.error.is_none() {
                result.failures = self.evaluate(&scenario, result.execution.as_ref(), &output);
            }
        }

        result.duration_ms = elapsed_ms(started_at, clock.now());
        result.success = result.failures.is_empty() && result.error.is_none();

        let status = if result.success { "passed" } else { "failed" };
        self.orchestrator.metrics().record_scenario(status);
        if result.success {
            info!(scenario = %scenario.id, duration_ms = result.duration_ms, "Scenario passed");
        } else {
            warn!(
                scenario = %scenario.id,
                failures = result.failures.len(),
                error = result.error.as_deref().unwrap_or(""),
                "Scenario failed"
            );
        }

        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(result)
    }

    /// Run the workflow under the scenario's timeout; returns its output (null on failure)
    async fn execute<T, F, Fut>(
        &self,
        scenario: &TestScenario,
        workflow: F,
        result: &mut ScenarioResult,
    ) -> Value
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let timeout_ms = scenario.timeout_ms.unwrap_or(self.default_timeout_ms);
        let correlation_id = format!("scenario:{}:{}", scenario.id, Uuid::new_v4());
        let mut config = ExecutionConfig::new(scenario.workflow_name.clone()).with_test_db(true);
        config.trigger = "scenario".to_string();
        config.correlation_id = Some(correlation_id.clone());
        config.breakpoints = scenario.breakpoints.clone();
        for (step, response) in &scenario.expected_llm_responses {
            config = config.with_llm_override(step.clone(), response.clone());
        }

        let handler = self
            .breakpoint_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let run = async {
            match handler {
                Some(handler) if !config.breakpoints.is_empty() => {
                    self.orchestrator
                        .execute_with_breakpoints(config, handler, workflow)
                        .await
                }
                _ => self.orchestrator.execute(config, workflow).await,
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(Ok(outcome)) => {
                result.execution = outcome.execution;
                result.error = outcome.error.map(|e| e.message);
                outcome
                    .result
                    .and_then(|v| serde_json::to_value(v).ok())
                    .unwrap_or(Value::Null)
            }
            Ok(Err(e)) => {
                result.error = Some(e.to_string());
                Value::Null
            }
            Err(_) => {
                let timeout = FlowProbeError::ScenarioTimeout {
                    scenario: scenario.name.clone(),
                    timeout_ms,
                };
                let message = timeout.to_string();
                let ledger = self.orchestrator.ledger();
                let abandoned = ledger
                    .get_all_executions()
                    .into_iter()
                    .find(|e| e.correlation_id == correlation_id);
                if let Some(execution) = abandoned {
                    ledger.complete_workflow(&execution.id, None, Some(ErrorDetail::new(&message)));
                    result.execution = ledger.export_execution(&execution.id);
                }
                result.error = Some(message);
                Value::Null
            }
        }
    }

    fn evaluate(
        &self,
        scenario: &TestScenario,
        execution: Option<&Execution>,
        output: &Value,
    ) -> Vec<AssertionFailure> {
        let mut failures = Vec::new();
        for assertion in &scenario.assertions {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.check(assertion, execution, output)
            }));
            let failure = match outcome {
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(failure))) => failure,
                Ok(Err(e)) => AssertionFailure {
                    assertion_id: assertion.id.clone(),
                    expected: assertion.description.clone(),
                    actual: "evaluation error".to_string(),
                    message: format!("Assertion evaluation failed: {:#}", e),
                },
                Err(_) => AssertionFailure {
                    assertion_id: assertion.id.clone(),
                    expected: assertion.description.clone(),
                    actual: "panic".to_string(),
                    message: "Assertion evaluation panicked".to_string(),
                },
            };
            warn!(
                scenario = %scenario.id,
                assertion = %assertion.id,
                expected = %failure.expected,
                actual = %failure.actual,
                "Assertion failed"
            );
            failures.push(failure);
        }
        failures
    }

    fn check(
        &self,
        assertion: &Assertion,
        execution: Option<&Execution>,
        output: &Value,
    ) -> anyhow::Result<Option<AssertionFailure>> {
        let fail = |expected: String, actual: String, message: String| {
            Some(AssertionFailure {
                assertion_id: assertion.id.clone(),
                expected,
                actual: preview(actual),
                message: if assertion.description.is_empty() {
                    message
                } else {
                    format!("{}: {}", assertion.description, message)
                },
            })
        };
        let condition = &assertion.condition;

        match assertion.assertion_type {
            AssertionType::OutputContains => {
                let haystack = serde_json::to_string(output)?;
                let needle = match condition {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string(other)?,
                };
                if haystack.contains(&needle) {
                    Ok(None)
                } else {
                    Ok(fail(
                        format!("Output containing \"{}\"", needle),
                        haystack,
                        "Workflow output does not contain the expected text".to_string(),
                    ))
                }
            }
            AssertionType::DatabaseState => {
                let table = condition
                    .get("table")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("condition.table is required"))?;
                let filters: Filters = match condition.get("where") {
                    Some(Value::Object(map)) => map.clone(),
                    Some(Value::Null) | None => Filters::new(),
                    Some(_) => anyhow::bail!("condition.where must be an object"),
                };
                let count = self.orchestrator.environment().count(table, &filters)?;
                match condition.get("count").and_then(Value::as_u64) {
                    Some(expected) if expected != count => Ok(fail(
                        format!("{} rows in {}", expected, table),
                        format!("{} rows", count),
                        format!("Row count of {} differs", table),
                    )),
                    _ => Ok(None),
                }
            }
            AssertionType::LlmCallMade => {
                let execution =
                    execution.ok_or_else(|| anyhow::anyhow!("no execution was recorded"))?;
                let field = |name: &str| condition.get(name).and_then(Value::as_str);
                let provider = field("provider");
                let model = field("model");
                let step = field("step").or(assertion.step.as_deref());

                let matching = execution
                    .llm_calls
                    .iter()
                    .filter(|c| provider.map_or(true, |p| c.provider == p))
                    .filter(|c| model.map_or(true, |m| c.model == m))
                    .filter(|c| {
                        step.map_or(true, |s| execution.step_name_of(&c.step_id) == Some(s))
                    })
                    .count();
                if matching > 0 {
                    Ok(None)
                } else {
                    Ok(fail(
                        format!("At least one LLM call matching {}", condition),
                        format!("{} LLM calls, none matching", execution.llm_calls.len()),
                        "No matching LLM call was made".to_string(),
                    ))
                }
            }
            AssertionType::DurationUnder => {
                let bound = condition
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("condition must be a millisecond bound"))?;
                let execution =
                    execution.ok_or_else(|| anyhow::anyhow!("no execution was recorded"))?;
                match execution.total_duration_ms {
                    Some(duration) if duration < bound => Ok(None),
                    Some(duration) => Ok(fail(
                        format!("Duration under {}ms", bound),
                        format!("{}ms", duration),
                        "Execution took too long".to_string(),
                    )),
                    None => Ok(fail(
                        format!("Duration under {}ms", bound),
                        "unfinished".to_string(),
                        "Execution never completed".to_string(),
                    )),
                }
            }
            AssertionType::Custom => {
                let name = custom_name(condition)
                    .ok_or_else(|| anyhow::anyhow!("condition must name a predicate"))?;
                let predicate = self
                    .predicates
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("custom assertion '{}' is not registered", name))?;
                let execution =
                    execution.ok_or_else(|| anyhow::anyhow!("no execution was recorded"))?;
                if predicate(execution, output)? {
                    Ok(None)
                } else {
                    Ok(fail(
                        format!("Custom assertion '{}' to pass", name),
                        "false".to_string(),
                        format!("Custom assertion '{}' returned false", name),
                    ))
                }
            }
        }
    }

    /// Run several scenarios with the same workflow
    ///
    /// Unknown ids produce a failed result. Sequential runs stop at the first failure
    /// unless `continue_on_failure` is set.
    pub async fn run_multiple_scenarios<T, F, Fut>(
        &self,
        ids: &[String],
        options: RunOptions,
        workflow: F,
    ) -> Vec<ScenarioResult>
    where
        T: Serialize,
        F: Fn(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let workflow = &workflow;
        if options.parallel {
            let runs = ids.iter().map(|id| async move {
                self.run_scenario(id, workflow)
                    .await
                    .unwrap_or_else(|e| self.missing_result(id, e))
            });
            return futures::future::join_all(runs).await;
        }

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self
                .run_scenario(id, workflow)
                .await
                .unwrap_or_else(|e| self.missing_result(id, e));
            let failed = !result.success;
            results.push(result);
            if failed && !options.continue_on_failure {
                warn!(scenario = %id, "Stopping after failed scenario");
                break;
            }
        }
        results
    }

    fn missing_result(&self, id: &str, error: FlowProbeError) -> ScenarioResult {
        let result = ScenarioResult {
            scenario_id: id.to_string(),
            scenario_name: id.to_string(),
            execution: None,
            success: false,
            failures: Vec::new(),
            started_at: self.orchestrator.clock().now(),
            duration_ms: 0,
            error: Some(error.to_string()),
        };
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        result
    }

    /// Every recorded result, oldest first
    pub fn results(&self) -> Vec<ScenarioResult> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Aggregate recorded results, optionally restricted to some scenario ids
    pub fn generate_report(&self, ids: Option<&[String]>) -> ScenarioReport {
        let results = self
            .results()
            .into_iter()
            .filter(|r| ids.map_or(true, |ids| ids.contains(&r.scenario_id)))
            .collect();
        ScenarioReport::from_results(results)
    }

    pub fn clear_results(&self) {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Whether a path has a scenario file extension
pub fn is_scenario_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScenarioDocument {
    Many(Vec<TestScenario>),
    One(Box<TestScenario>),
}

/// Parse a scenario file without registering it
pub fn parse_scenario_file(path: &Path) -> Result<Vec<TestScenario>> {
    let content = std::fs::read_to_string(path)?;
    let document: ScenarioDocument = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("yaml" | "yml") => serde_yaml::from_str(&content)?,
        _ => {
            return Err(FlowProbeError::InvalidScenario(format!(
                "{}: expected a .json, .yaml or .yml file",
                path.display()
            )))
        }
    };
    let scenarios = match document {
        ScenarioDocument::Many(list) => list,
        ScenarioDocument::One(one) => vec![*one],
    };
    for scenario in &scenarios {
        scenario.validate()?;
    }
    Ok(scenarios)
}
