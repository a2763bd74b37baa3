//! Execution orchestrator
//!
//! [`Orchestrator`] wires the ledger, response cache and environment switch around a
//! caller-supplied workflow function. The workflow receives a [`WorkflowContext`] bound to
//! its own execution and calls back through it for every step, LLM call and database
//! operation; errors from those bodies reach the workflow unchanged. Only the top-level
//! [`Orchestrator::execute`] turns a failed workflow into data.

use crate::cache::{ResponseCache, WrapOptions};
use crate::clock::{system_clock, SharedClock};
use crate::config::HarnessConfig;
use crate::environment::{Connector, DbMode, EnvironmentSwitch, MemoryConnector, SqliteConnector};
use crate::error::{FlowProbeError, Result};
use crate::ledger::{ExecutionLedger, LedgerSettings, NewLlmCall, PerformanceMetrics, WorkflowStart};
use crate::metrics::HarnessMetrics;
use crate::models::{
    DatabaseOperation, DbOperationKind, ErrorDetail, Execution, ExecutionStatus, StepStatus,
    StepType, TokenUsage,
};
use crate::persist::{FileStore, MemoryStore, NullStore, SharedStore};
use crate::store::SharedClient;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Step duration delta reported by [`Orchestrator::compare_executions`]
pub const STEP_DURATION_THRESHOLD_MS: u64 = 1_000;
/// LLM latency delta reported by [`Orchestrator::compare_executions`]
pub const LLM_LATENCY_THRESHOLD_MS: u64 = 2_000;
/// Database timing delta reported by [`Orchestrator::compare_executions`]
pub const DB_TIMING_THRESHOLD_MS: u64 = 500;

/// Pre-seeded LLM response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmOverride {
    pub step: String,
    /// Exact prompt; `None` answers every prompt of the step
    #[serde(default)]
    pub prompt: Option<String>,
    pub response: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Overrides applied before the workflow runs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOverrides {
    #[serde(default)]
    pub llm_responses: Vec<LlmOverride>,
    /// Process environment variables set for the run and restored afterwards
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Per-run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub name: String,
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Switch the environment before running; `None` keeps the active store
    #[serde(default)]
    pub use_test_db: Option<bool>,
    /// Route LLM calls through the response cache
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub breakpoints: Vec<String>,
    #[serde(default)]
    pub overrides: ExecutionOverrides,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
}

fn default_trigger() -> String {
    "manual".to_string()
}

fn default_true() -> bool {
    true
}

impl ExecutionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger: default_trigger(),
            correlation_id: None,
            use_test_db: None,
            use_cache: true,
            breakpoints: Vec::new(),
            overrides: ExecutionOverrides::default(),
            parent_execution_id: None,
        }
    }

    pub fn with_test_db(mut self, use_test_db: bool) -> Self {
        self.use_test_db = Some(use_test_db);
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_breakpoint(mut self, step: impl Into<String>) -> Self {
        self.breakpoints.push(step.into());
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_llm_override(mut self, step: impl Into<String>, response: Value) -> Self {
        self.overrides.llm_responses.push(LlmOverride {
            step: step.into(),
            prompt: None,
            response,
            model: None,
            temperature: None,
        });
        self
    }
}

/// Result of [`Orchestrator::execute`]
#[derive(Debug, Clone)]
pub struct ExecutionOutcome<T> {
    /// Empty when the ledger is disabled
    pub execution_id: String,
    pub result: Option<T>,
    pub execution: Option<Execution>,
    pub error: Option<ErrorDetail>,
    pub performance: Option<PerformanceMetrics>,
}

impl<T> ExecutionOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Settings of [`Orchestrator::replay`]
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Snapshot restored before the run
    pub snapshot_id: Option<String>,
    /// Serve the recorded LLM responses to the replayed run
    pub use_recorded_responses: bool,
    /// Only re-seed responses from this step onward
    pub from_step: Option<String>,
    pub overrides: ExecutionOverrides,
}

/// What a breakpoint handler sees
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreakpointContext {
    pub execution_id: String,
    pub step_id: String,
    pub step_name: String,
    pub input: Option<Value>,
}

/// How to continue from a breakpoint
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointAction {
    Continue,
    /// Mark the step completed without running its body
    Skip,
    /// Run the body with a replacement input
    ModifyInput(Value),
}

/// Decides what happens at a breakpoint; awaited inline before the step body
#[async_trait]
pub trait BreakpointHandler: Send + Sync {
    async fn on_breakpoint(&self, context: BreakpointContext) -> BreakpointAction;
}

#[async_trait]
impl<F> BreakpointHandler for F
where
    F: Fn(BreakpointContext) -> BreakpointAction + Send + Sync,
{
    async fn on_breakpoint(&self, context: BreakpointContext) -> BreakpointAction {
        self(context)
    }
}

/// Options of [`WorkflowContext::execute_llm_call`]
#[derive(Debug, Clone)]
pub struct LlmCallOptions {
    pub provider: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub force_refresh: bool,
    /// Priced against the `usage.total_tokens` of the response
    pub cost_per_1k_tokens: Option<f64>,
}

impl Default for LlmCallOptions {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            temperature: None,
            force_refresh: false,
            cost_per_1k_tokens: None,
        }
    }
}

/// LLM responses pinned for the lifetime of one run
///
/// Consulted before the shared response cache and never written into it, so a run's
/// overrides cannot answer another run's calls.
#[derive(Default)]
struct RunOverrides {
    /// cache key -> response, for overrides naming an exact prompt
    exact: HashMap<String, Value>,
    /// Overrides answering every prompt of a step; later entries win
    by_step: Vec<LlmOverride>,
}

impl RunOverrides {
    fn new(cache: &ResponseCache, workflow: &str, overrides: &[LlmOverride]) -> Self {
        let mut pinned = Self::default();
        for o in overrides {
            match &o.prompt {
                Some(prompt) => {
                    let key =
                        cache.key_for(workflow, &o.step, prompt, o.model.as_deref(), o.temperature);
                    pinned.exact.insert(key, o.response.clone());
                }
                None => pinned.by_step.push(o.clone()),
            }
        }
        pinned
    }

    fn lookup(
        &self,
        key: &str,
        step: &str,
        model: Option<&str>,
        temperature: Option<f64>,
    ) -> Option<&Value> {
        self.exact.get(key).or_else(|| {
            self.by_step
                .iter()
                .rev()
                .find(|o| {
                    o.step == step
                        && o.model.as_deref().map_or(true, |m| model == Some(m))
                        && o.temperature.map_or(true, |t| temperature == Some(t))
                })
                .map(|o| &o.response)
        })
    }
}

/// Model name recorded when none was requested; keys the same cache slot as `None`
const DEFAULT_MODEL: &str = "default";

struct ContextInner {
    execution_id: String,
    workflow: String,
    use_cache: bool,
    include_stacks: bool,
    breakpoints: HashSet<String>,
    handler: Option<Arc<dyn BreakpointHandler>>,
    pinned: RunOverrides,
    ledger: Arc<ExecutionLedger>,
    cache: Arc<ResponseCache>,
    environment: Arc<EnvironmentSwitch>,
}

/// Instrumentation handle bound to one execution
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub fn execution_id(&self) -> &str {
        &self.inner.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow
    }

    /// Untracked client of the active backing store
    pub fn client(&self) -> SharedClient {
        self.inner.environment.client()
    }

    async fn run_step<T, F, Fut>(
        &self,
        name: &str,
        step_type: StepType,
        input: Option<Value>,
        f: F,
    ) -> anyhow::Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(String, Option<Value>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ctx = &self.inner;
        let step_id = ctx
            .ledger
            .add_step(&ctx.execution_id, name, step_type, input.clone());
        let mut input = input;

        if ctx.breakpoints.contains(name) {
            match &ctx.handler {
                Some(handler) => {
                    info!(execution_id = %ctx.execution_id, step = name, "Breakpoint hit");
                    ctx.ledger
                        .set_execution_status(&ctx.execution_id, ExecutionStatus::Paused);
                    let action = handler
                        .on_breakpoint(BreakpointContext {
                            execution_id: ctx.execution_id.clone(),
                            step_id: step_id.clone(),
                            step_name: name.to_string(),
                            input: input.clone(),
                        })
                        .await;
                    ctx.ledger
                        .set_execution_status(&ctx.execution_id, ExecutionStatus::Running);

                    match action {
                        BreakpointAction::Continue => {}
                        BreakpointAction::Skip => {
                            info!(step = name, "Step skipped at breakpoint");
                            ctx.ledger
                                .complete_step(&step_id, Some(json!({"skipped": true})), None);
                            return Ok(None);
                        }
                        BreakpointAction::ModifyInput(new_input) => {
                            info!(step = name, "Step input replaced at breakpoint");
                            input = Some(new_input);
                        }
                    }
                }
                None => warn!(step = name, "Breakpoint set but no handler installed"),
            }
        }

        ctx.ledger.start_step(&step_id);
        match f(step_id.clone(), input).await {
            Ok(value) => {
                ctx.ledger
                    .complete_step(&step_id, serde_json::to_value(&value).ok(), None);
                Ok(Some(value))
            }
            Err(e) => {
                ctx.ledger.complete_step(
                    &step_id,
                    None,
                    Some(ErrorDetail::from_anyhow(&e, ctx.include_stacks)),
                );
                Err(e)
            }
        }
    }

    /// Run a named step; `Ok(None)` means a breakpoint skipped it
    pub async fn execute_step<T, F, Fut>(
        &self,
        name: &str,
        step_type: StepType,
        input: Option<Value>,
        f: F,
    ) -> anyhow::Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(Option<Value>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_step(name, step_type, input, |_, input| f(input))
            .await
    }

    /// Run an LLM call step through the response cache
    pub async fn execute_llm_call<T, F, Fut>(
        &self,
        step_name: &str,
        prompt: &str,
        options: LlmCallOptions,
        f: F,
    ) -> anyhow::Result<Option<T>>
    where
        T: Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ctx = self.inner.clone();
        let input = json!({
            "prompt": prompt,
            "model": options.model,
            "temperature": options.temperature,
        });

        self.run_step(step_name, StepType::LlmCall, Some(input), |step_id, _| async move {
            let model = options.model.as_deref();
            let key = ctx
                .cache
                .key_for(&ctx.workflow, step_name, prompt, model, options.temperature);
            let call_id = ctx.ledger.track_llm_call(
                &step_id,
                NewLlmCall {
                    provider: options.provider.clone(),
                    model: model.unwrap_or(DEFAULT_MODEL).to_string(),
                    prompt: prompt.to_string(),
                    temperature: options.temperature,
                    cache_key: Some(key.clone()),
                },
            );

            let pinned = ctx
                .pinned
                .lookup(&key, step_name, model, options.temperature)
                .cloned();
            let outcome = if let Some(response) = pinned {
                debug!(step = step_name, "Serving pinned LLM response");
                serde_json::from_value::<T>(response)
                    .map(|v| (v, true))
                    .map_err(anyhow::Error::from)
            } else if ctx.use_cache {
                let wrap = WrapOptions {
                    model: options.model.clone(),
                    temperature: options.temperature,
                    force_refresh: options.force_refresh,
                };
                ctx.cache
                    .wrap_llm_call(&ctx.workflow, step_name, prompt, f, &wrap)
                    .await
                    .map(|r| (r.value, r.cache_hit))
            } else {
                f().await.map(|v| (v, false))
            };

            match outcome {
                Ok((value, cache_hit)) => {
                    let response = serde_json::to_value(&value).unwrap_or(Value::Null);
                    let tokens = TokenUsage::from_response(&response);
                    let cost = match (&tokens, options.cost_per_1k_tokens) {
                        (Some(t), Some(price)) if !cache_hit => {
                            Some(t.total_tokens as f64 / 1000.0 * price)
                        }
                        _ => None,
                    };
                    ctx.ledger
                        .complete_llm_call(&call_id, response, tokens, cost, cache_hit);
                    Ok(value)
                }
                Err(e) => {
                    ctx.ledger.complete_llm_call(
                        &call_id,
                        json!({"error": e.to_string()}),
                        None,
                        None,
                        false,
                    );
                    Err(e)
                }
            }
        })
        .await
    }

    /// Run a database operation step; `f` receives the active store's client
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_database_operation<T, F, Fut>(
        &self,
        step_name: &str,
        operation: DbOperationKind,
        table: &str,
        query: &str,
        params: Option<Value>,
        f: F,
    ) -> anyhow::Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(SharedClient) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ctx = self.inner.clone();
        let input = json!({"operation": operation, "table": table, "query": query});

        self.run_step(
            step_name,
            StepType::DatabaseOperation,
            Some(input),
            |step_id, _| async move {
                let op_id = ctx
                    .ledger
                    .track_database_operation(&step_id, operation, table, query, params);
                let ticket = ctx.environment.in_flight().ticket(table, operation);
                let outcome = f(ctx.environment.client()).await;
                drop(ticket);
                match outcome {
                    Ok(value) => {
                        let result = serde_json::to_value(&value).ok();
                        let rows = match &result {
                            Some(Value::Array(rows)) => Some(rows.len() as u64),
                            Some(Value::Number(n)) => n.as_u64(),
                            _ => None,
                        };
                        ctx.ledger
                            .complete_database_operation(&op_id, result, rows, None);
                        Ok(value)
                    }
                    Err(e) => {
                        ctx.ledger.complete_database_operation(
                            &op_id,
                            None,
                            None,
                            Some(e.to_string()),
                        );
                        Err(e)
                    }
                }
            },
        )
        .await
    }

    /// Run a database step whose every query is recorded automatically
    pub async fn execute_with_database<T, F, Fut>(&self, step_name: &str, f: F) -> anyhow::Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(SharedClient) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ctx = self.inner.clone();
        self.run_step(step_name, StepType::DatabaseOperation, None, |step_id, _| {
            let client = ctx.environment.client_for_step(ctx.ledger.clone(), &step_id);
            f(client)
        })
        .await
    }
}

/// Sets process environment variables and restores the previous values on drop
struct EnvVarOverrides {
    previous: Vec<(String, Option<String>)>,
}

impl EnvVarOverrides {
    fn apply(vars: &BTreeMap<String, String>) -> Self {
        let mut previous = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            previous.push((key.clone(), std::env::var(key).ok()));
            std::env::set_var(key, value);
        }
        Self { previous }
    }
}

impl Drop for EnvVarOverrides {
    fn drop(&mut self) {
        for (key, value) in self.previous.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(&key, v),
                None => std::env::remove_var(&key),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Kind of a difference between two executions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    MissingStep,
    MissingLlmCall,
    MissingDatabaseOperation,
    Status,
    Output,
    StepDuration,
    LlmLatency,
    DatabaseTiming,
}

/// One difference between execution A and execution B
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Difference {
    pub kind: DifferenceKind,
    /// What differs, e.g. `steps.analyze#0`
    pub path: String,
    pub a: Option<Value>,
    pub b: Option<Value>,
    pub message: String,
}

/// Structural diff of two executions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionComparison {
    pub execution_a: String,
    pub execution_b: String,
    pub differences: Vec<Difference>,
    pub total_differences: usize,
    pub by_kind: BTreeMap<DifferenceKind, usize>,
    /// Total duration of B minus total duration of A
    pub performance_delta_ms: i64,
}

/// Key entries by `label#occurrence` so repeated names pair up in order
fn index_by<T>(items: &[T], label: impl Fn(&T) -> String) -> BTreeMap<String, &T> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out = BTreeMap::new();
    for item in items {
        let l = label(item);
        let n = seen.entry(l.clone()).or_insert(0);
        out.insert(format!("{}#{}", l, n), item);
        *n += 1;
    }
    out
}

fn missing<T>(
    kind: DifferenceKind,
    prefix: &str,
    a: &BTreeMap<String, &T>,
    b: &BTreeMap<String, &T>,
    out: &mut Vec<Difference>,
) {
    for key in a.keys().filter(|k| !b.contains_key(*k)) {
        out.push(Difference {
            kind,
            path: format!("{}.{}", prefix, key),
            a: Some(json!(key)),
            b: None,
            message: format!("{} {} missing from B", prefix, key),
        });
    }
    for key in b.keys().filter(|k| !a.contains_key(*k)) {
        out.push(Difference {
            kind,
            path: format!("{}.{}", prefix, key),
            a: None,
            b: Some(json!(key)),
            message: format!("{} {} missing from A", prefix, key),
        });
    }
}

fn timing(
    kind: DifferenceKind,
    path: String,
    a: Option<u64>,
    b: Option<u64>,
    threshold: u64,
    out: &mut Vec<Difference>,
) {
    if let (Some(a), Some(b)) = (a, b) {
        if a.abs_diff(b) > threshold {
            out.push(Difference {
                kind,
                path: path.clone(),
                a: Some(json!(a)),
                b: Some(json!(b)),
                message: format!("{} changed by {}ms", path, b as i64 - a as i64),
            });
        }
    }
}

/// Diff two recorded executions
pub fn compare(a: &Execution, b: &Execution) -> ExecutionComparison {
    let mut differences = Vec::new();

    if a.status != b.status {
        differences.push(Difference {
            kind: DifferenceKind::Status,
            path: "status".to_string(),
            a: Some(json!(a.status)),
            b: Some(json!(b.status)),
            message: format!("Status {} vs {}", a.status, b.status),
        });
    }
    if a.output != b.output {
        differences.push(Difference {
            kind: DifferenceKind::Output,
            path: "output".to_string(),
            a: a.output.clone(),
            b: b.output.clone(),
            message: "Workflow output differs".to_string(),
        });
    }

    let steps_a = index_by(&a.steps, |s| s.name.clone());
    let steps_b = index_by(&b.steps, |s| s.name.clone());
    missing(DifferenceKind::MissingStep, "steps", &steps_a, &steps_b, &mut differences);
    for (key, sa) in &steps_a {
        let Some(sb) = steps_b.get(key) else { continue };
        let path = format!("steps.{}", key);
        if sa.status != sb.status {
            differences.push(Difference {
                kind: DifferenceKind::Status,
                path: path.clone(),
                a: Some(json!(sa.status)),
                b: Some(json!(sb.status)),
                message: format!("Step {} status {} vs {}", sa.name, sa.status, sb.status),
            });
        }
        if sa.output != sb.output {
            differences.push(Difference {
                kind: DifferenceKind::Output,
                path: path.clone(),
                a: sa.output.clone(),
                b: sb.output.clone(),
                message: format!("Step {} output differs", sa.name),
            });
        }
        timing(
            DifferenceKind::StepDuration,
            path,
            sa.duration_ms,
            sb.duration_ms,
            STEP_DURATION_THRESHOLD_MS,
            &mut differences,
        );
    }

    let step_name = |e: &Execution, id: &str| e.step_name_of(id).unwrap_or("?").to_string();
    let calls_a = index_by(&a.llm_calls, |c| step_name(a, &c.step_id));
    let calls_b = index_by(&b.llm_calls, |c| step_name(b, &c.step_id));
    missing(DifferenceKind::MissingLlmCall, "llm_calls", &calls_a, &calls_b, &mut differences);
    for (key, ca) in &calls_a {
        if let Some(cb) = calls_b.get(key) {
            timing(
                DifferenceKind::LlmLatency,
                format!("llm_calls.{}", key),
                ca.latency_ms,
                cb.latency_ms,
                LLM_LATENCY_THRESHOLD_MS,
                &mut differences,
            );
        }
    }

    let op_label = |e: &Execution, o: &DatabaseOperation| {
        format!("{}:{}:{}", step_name(e, &o.step_id), o.operation, o.table)
    };
    let ops_a = index_by(&a.database_operations, |o| op_label(a, o));
    let ops_b = index_by(&b.database_operations, |o| op_label(b, o));
    missing(
        DifferenceKind::MissingDatabaseOperation,
        "database_operations",
        &ops_a,
        &ops_b,
        &mut differences,
    );
    for (key, oa) in &ops_a {
        if let Some(ob) = ops_b.get(key) {
            timing(
                DifferenceKind::DatabaseTiming,
                format!("database_operations.{}", key),
                oa.execution_time_ms,
                ob.execution_time_ms,
                DB_TIMING_THRESHOLD_MS,
                &mut differences,
            );
        }
    }

    let mut by_kind = BTreeMap::new();
    for d in &differences {
        *by_kind.entry(d.kind).or_insert(0) += 1;
    }

    ExecutionComparison {
        execution_a: a.id.clone(),
        execution_b: b.id.clone(),
        total_differences: differences.len(),
        differences,
        by_kind,
        performance_delta_ms: b.total_duration_ms.unwrap_or(0) as i64
            - a.total_duration_ms.unwrap_or(0) as i64,
    }
}

/// Top-level façade over ledger, cache and environment
pub struct Orchestrator {
    config: HarnessConfig,
    clock: SharedClock,
    ledger: Arc<ExecutionLedger>,
    cache: Arc<ResponseCache>,
    environment: Arc<EnvironmentSwitch>,
    metrics: HarnessMetrics,
    env_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Assemble from explicit backends
    pub fn new(
        config: HarnessConfig,
        clock: SharedClock,
        connector: Arc<dyn Connector>,
        cache_store: SharedStore,
        snapshot_store: SharedStore,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = HarnessMetrics::new();
        let ledger = ExecutionLedger::new(LedgerSettings::from(&config), clock.clone())
            .with_metrics(metrics.clone());
        let cache = ResponseCache::new(&config.llm_cache, clock.clone(), cache_store);
        let environment =
            EnvironmentSwitch::new(&config.database, connector, snapshot_store, clock.clone())?;

        Ok(Self {
            config,
            clock,
            ledger: Arc::new(ledger),
            cache: Arc::new(cache),
            environment: Arc::new(environment),
            metrics,
            env_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// SQLite stores and file persistence at the configured locations
    pub fn from_config(config: HarnessConfig) -> Result<Self> {
        let connector = Arc::new(SqliteConnector::new(&config.database));
        let cache_store: SharedStore = if config.llm_cache.persist {
            Arc::new(FileStore::new(&config.llm_cache.directory))
        } else {
            Arc::new(NullStore)
        };
        let snapshot_store = Arc::new(FileStore::new(&config.database.snapshot_directory));
        let orchestrator = Self::new(config, system_clock(), connector, cache_store, snapshot_store)?;

        let warmed = orchestrator.cache.load_from_store();
        if warmed > 0 {
            info!(entries = warmed, "Response cache warmed from disk");
        }
        orchestrator.refresh_state_metrics();
        Ok(orchestrator)
    }

    /// Publish current cache and snapshot counts to the metric registry
    pub fn refresh_state_metrics(&self) {
        self.metrics
            .set_state(self.cache.len(), self.environment.list_snapshots().len());
    }

    /// Everything in memory; nothing touches the filesystem
    pub fn in_memory(config: HarnessConfig, clock: SharedClock) -> Result<Self> {
        let connector = Arc::new(MemoryConnector::new(&config.database.tables)?);
        Self::new(
            config,
            clock,
            connector,
            Arc::new(NullStore),
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn environment(&self) -> &Arc<EnvironmentSwitch> {
        &self.environment
    }

    pub fn metrics(&self) -> &HarnessMetrics {
        &self.metrics
    }

    /// Run a workflow; its errors and panics come back in the outcome
    ///
    /// `Err` is reserved for harness setup failures such as an unreachable backing store.
    pub async fn execute<T, F, Fut>(&self, config: ExecutionConfig, f: F) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(config, None, f).await
    }

    /// Run a workflow pausing at its breakpoints for `handler`
    pub async fn execute_with_breakpoints<T, F, Fut>(
        &self,
        config: ExecutionConfig,
        handler: Arc<dyn BreakpointHandler>,
        f: F,
    ) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(config, Some(handler), f).await
    }

    async fn run<T, F, Fut>(
        &self,
        config: ExecutionConfig,
        handler: Option<Arc<dyn BreakpointHandler>>,
        f: F,
    ) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(use_test_db) = config.use_test_db {
            self.environment
                .switch_mode(DbMode::from_use_test_db(use_test_db))?;
        }

        let execution_id = self.ledger.start_workflow_with(WorkflowStart {
            name: config.name.clone(),
            trigger: config.trigger.clone(),
            correlation_id: config.correlation_id.clone(),
            environment: Some(self.environment.mode().to_string()),
            parent_execution_id: config.parent_execution_id.clone(),
        });

        let pinned = RunOverrides::new(&self.cache, &config.name, &config.overrides.llm_responses);
        let _env_guard = if config.overrides.env_vars.is_empty() {
            None
        } else {
            Some(self.env_lock.lock().await)
        };
        let env_overrides = EnvVarOverrides::apply(&config.overrides.env_vars);

        let include_stacks = self.config.logging.include_stacks;
        let context = WorkflowContext {
            inner: Arc::new(ContextInner {
                execution_id: execution_id.clone(),
                workflow: config.name.clone(),
                use_cache: config.use_cache,
                include_stacks,
                breakpoints: config.breakpoints.iter().cloned().collect(),
                handler,
                pinned,
                ledger: self.ledger.clone(),
                cache: self.cache.clone(),
                environment: self.environment.clone(),
            }),
        };

        let outcome = AssertUnwindSafe(f(context)).catch_unwind().await;
        drop(env_overrides);

        let (result, error) = match outcome {
            Ok(Ok(value)) => {
                let output = serde_json::to_value(&value).ok();
                self.ledger.complete_workflow(&execution_id, output, None);
                (Some(value), None)
            }
            Ok(Err(e)) => {
                error!(execution_id = %execution_id, workflow = %config.name, error = %e, "Workflow failed");
                let detail = ErrorDetail::from_anyhow(&e, include_stacks);
                self.ledger
                    .complete_workflow(&execution_id, None, Some(detail.clone()));
                (None, Some(detail))
            }
            Err(payload) => {
                let message = format!("Workflow panicked: {}", panic_message(payload.as_ref()));
                error!(execution_id = %execution_id, workflow = %config.name, "{}", message);
                let detail = ErrorDetail::new(message);
                self.ledger
                    .complete_workflow(&execution_id, None, Some(detail.clone()));
                (None, Some(detail))
            }
        };

        Ok(ExecutionOutcome {
            performance: self.ledger.get_performance_metrics(&execution_id),
            execution: self.ledger.export_execution(&execution_id),
            execution_id,
            result,
            error,
        })
    }

    /// Re-run a recorded execution's workflow under its original environment
    pub async fn replay<T, F, Fut>(
        &self,
        execution_id: &str,
        replay: ReplayConfig,
        f: F,
    ) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let original = self
            .ledger
            .export_execution(execution_id)
            .ok_or_else(|| FlowProbeError::ExecutionNotFound(execution_id.to_string()))?;

        let use_test_db = match original.environment.as_str() {
            "test" => Some(true),
            "production" => Some(false),
            _ => None,
        };
        if let Some(use_test_db) = use_test_db {
            self.environment
                .switch_mode(DbMode::from_use_test_db(use_test_db))?;
        }
        if let Some(snapshot_id) = &replay.snapshot_id {
            self.environment.restore_snapshot(snapshot_id)?;
        }

        let mut pinned = Vec::new();
        if replay.use_recorded_responses {
            let start = match &replay.from_step {
                Some(step) => original
                    .steps
                    .iter()
                    .position(|s| &s.name == step)
                    .ok_or_else(|| {
                        FlowProbeError::Other(format!(
                            "Step '{}' not found in execution {}",
                            step, execution_id
                        ))
                    })?,
                None => 0,
            };
            let replayed: HashSet<&str> = original.steps[start..]
                .iter()
                .map(|s| s.id.as_str())
                .collect();

            for call in original
                .llm_calls
                .iter()
                .filter(|c| replayed.contains(c.step_id.as_str()))
            {
                let (Some(response), Some(step)) = (&call.response, original.step(&call.step_id))
                else {
                    continue;
                };
                if step.status != StepStatus::Completed {
                    continue;
                }
                pinned.push(LlmOverride {
                    step: step.name.clone(),
                    prompt: Some(call.prompt.clone()),
                    response: response.clone(),
                    model: Some(call.model.clone()),
                    temperature: call.temperature,
                });
            }
            info!(execution_id, seeded = pinned.len(), "Recorded responses pinned for replay");
        }
        pinned.extend(replay.overrides.llm_responses);

        let config = ExecutionConfig {
            name: original.name.clone(),
            trigger: "replay".to_string(),
            correlation_id: Some(original.correlation_id.clone()),
            use_test_db,
            use_cache: true,
            breakpoints: Vec::new(),
            overrides: ExecutionOverrides {
                llm_responses: pinned,
                env_vars: replay.overrides.env_vars,
            },
            parent_execution_id: Some(execution_id.to_string()),
        };
        self.execute(config, f).await
    }

    /// Structural diff of two recorded executions
    pub fn compare_executions(&self, a: &str, b: &str) -> Result<ExecutionComparison> {
        let a = self
            .ledger
            .export_execution(a)
            .ok_or_else(|| FlowProbeError::ExecutionNotFound(a.to_string()))?;
        let b = self
            .ledger
            .export_execution(b)
            .ok_or_else(|| FlowProbeError::ExecutionNotFound(b.to_string()))?;
        Ok(compare(&a, &b))
    }
}
