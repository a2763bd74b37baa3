//! In-memory execution ledger
//!
//! Records executions, their steps, LLM calls and database operations, and derives
//! duration, cost and bottleneck metrics on demand. Every method is addressed by an
//! explicit id, so concurrent executions never share an implicit "current" pointer.
//!
//! When the ledger is disabled every call is a guard check and nothing else: tracking
//! methods return an empty id and readers return `None` or an empty list.

use crate::clock::{elapsed_ms, SharedClock};
use crate::config::HarnessConfig;
use crate::metrics::HarnessMetrics;
use crate::models::{
    truncate_payload, DatabaseOperation, DbOperationKind, ErrorDetail, Execution,
    ExecutionStatus, LlmCall, Step, StepStatus, StepType, TokenUsage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Number of entries in the bottleneck ranking
pub const BOTTLENECK_LIMIT: usize = 5;

/// Ledger knobs derived from [`HarnessConfig`]
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub enabled: bool,
    pub max_payload_size: usize,
    pub slow_query_threshold_ms: u64,
    pub slow_llm_threshold_ms: u64,
    pub environment: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for LedgerSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_payload_size: config.logging.max_payload_size,
            slow_query_threshold_ms: config.performance.slow_query_threshold_ms,
            slow_llm_threshold_ms: config.performance.slow_llm_threshold_ms,
            environment: config.mode.to_string(),
        }
    }
}

/// State transition emitted to listeners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    WorkflowStarted {
        execution_id: String,
        name: String,
    },
    StepAdded {
        execution_id: String,
        step_id: String,
        name: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
    },
    LlmCallStarted {
        execution_id: String,
        call_id: String,
        model: String,
    },
    LlmCallCompleted {
        execution_id: String,
        call_id: String,
        latency_ms: u64,
        cache_hit: bool,
    },
    DatabaseOperationStarted {
        execution_id: String,
        operation_id: String,
        table: String,
        operation: DbOperationKind,
    },
    DatabaseOperationCompleted {
        execution_id: String,
        operation_id: String,
        execution_time_ms: u64,
        failed: bool,
    },
    WorkflowStatusChanged {
        execution_id: String,
        status: ExecutionStatus,
    },
    WorkflowCompleted {
        execution_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
    },
}

/// Observer of ledger events
///
/// Errors returned by a listener are logged and never reach the instrumented code.
pub trait LedgerListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent) -> anyhow::Result<()>;
}

impl<F> LedgerListener for F
where
    F: Fn(&LedgerEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`ExecutionLedger::add_listener`]
pub type ListenerId = u64;

/// Parameters of a new execution
#[derive(Debug, Clone, Default)]
pub struct WorkflowStart {
    pub name: String,
    pub trigger: String,
    pub correlation_id: Option<String>,
    pub environment: Option<String>,
    pub parent_execution_id: Option<String>,
}

/// Parameters of a new LLM call
#[derive(Debug, Clone, Default)]
pub struct NewLlmCall {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub cache_key: Option<String>,
}

/// Kind of entry ranked as a bottleneck
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Step,
    LlmCall,
    DatabaseOperation,
}

/// One of the longest-running entries of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub id: String,
    pub label: String,
    pub duration_ms: u64,
    /// Share of the execution's total duration, 0-100
    pub percentage: f64,
}

/// Derived timing breakdown of one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub execution_id: String,
    pub total_duration_ms: u64,
    pub total_cost: f64,
    /// step id -> duration
    pub step_durations: BTreeMap<String, u64>,
    /// call id -> latency
    pub llm_latencies: BTreeMap<String, u64>,
    /// operation id -> execution time
    pub db_timings: BTreeMap<String, u64>,
    pub cache_hits: usize,
    pub bottlenecks: Vec<Bottleneck>,
}

#[derive(Default)]
struct LedgerState {
    executions: HashMap<String, Execution>,
    order: Vec<String>,
    step_owner: HashMap<String, String>,
    call_owner: HashMap<String, String>,
    op_owner: HashMap<String, String>,
}

/// Append-only record of workflow executions
pub struct ExecutionLedger {
    settings: LedgerSettings,
    clock: SharedClock,
    state: Mutex<LedgerState>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LedgerListener>)>>,
    next_listener: AtomicU64,
    metrics: Option<HarnessMetrics>,
}

impl ExecutionLedger {
    /// Create a ledger with the given settings and time source
    pub fn new(settings: LedgerSettings, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            state: Mutex::new(LedgerState::default()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            metrics: None,
        }
    }

    /// Attach a metric set updated on every completion
    pub fn with_metrics(mut self, metrics: HarnessMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a listener for every subsequent event
    pub fn add_listener(&self, listener: Arc<dyn LedgerListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Unregister a listener; returns false if it was unknown
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: LedgerEvent) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if let Err(e) = listener.on_event(&event) {
                warn!(error = %e, "Ledger listener failed");
            }
        }
    }

    /// Create and activate a new execution; returns its id (empty when disabled)
    pub fn start_workflow(&self, name: &str, trigger: &str, correlation_id: Option<&str>) -> String {
        self.start_workflow_with(WorkflowStart {
            name: name.to_string(),
            trigger: trigger.to_string(),
            correlation_id: correlation_id.map(str::to_string),
            ..Default::default()
        })
    }

    /// Create a new execution with full parameters
    pub fn start_workflow_with(&self, start: WorkflowStart) -> String {
        if !self.settings.enabled {
            return String::new();
        }

        let id = Self::new_id();
        let execution = Execution {
            id: id.clone(),
            name: start.name.clone(),
            trigger: start.trigger,
            correlation_id: start.correlation_id.unwrap_or_else(Self::new_id),
            start_time: self.clock.now(),
            end_time: None,
            status: ExecutionStatus::Running,
            steps: Vec::new(),
            llm_calls: Vec::new(),
            database_operations: Vec::new(),
            total_duration_ms: None,
            total_cost: 0.0,
            environment: start
                .environment
                .unwrap_or_else(|| self.settings.environment.clone()),
            parent_execution_id: start.parent_execution_id,
            output: None,
            error: None,
        };

        {
            let mut state = self.lock();
            state.executions.insert(id.clone(), execution);
            state.order.push(id.clone());
        }

        if let Some(metrics) = &self.metrics {
            metrics.inc_active_executions();
        }
        info!(execution_id = %id, workflow = %start.name, "Workflow started");
        self.emit(LedgerEvent::WorkflowStarted {
            execution_id: id.clone(),
            name: start.name,
        });
        id
    }

    /// Append a pending step to an execution; returns its id (empty when disabled)
    pub fn add_step(
        &self,
        execution_id: &str,
        name: &str,
        step_type: StepType,
        input: Option<Value>,
    ) -> String {
        if !self.settings.enabled {
            return String::new();
        }

        let step_id = Self::new_id();
        let now = self.clock.now();
        let max = self.settings.max_payload_size;
        {
            let mut state = self.lock();
            let Some(execution) = state.executions.get_mut(execution_id) else {
                debug!(execution_id, "add_step on unknown execution ignored");
                return String::new();
            };
            execution.steps.push(Step {
                id: step_id.clone(),
                name: name.to_string(),
                step_type,
                timestamp: now,
                completed_at: None,
                duration_ms: None,
                status: StepStatus::Pending,
                input: input.map(|v| truncate_payload(&v, max)),
                output: None,
                error: None,
            });
            state
                .step_owner
                .insert(step_id.clone(), execution_id.to_string());
        }

        debug!(execution_id, step_id = %step_id, step = name, "Step added");
        self.emit(LedgerEvent::StepAdded {
            execution_id: execution_id.to_string(),
            step_id: step_id.clone(),
            name: name.to_string(),
        });
        step_id
    }

    /// Move a pending step to running
    pub fn start_step(&self, step_id: &str) {
        if !self.settings.enabled {
            return;
        }

        let now = self.clock.now();
        let execution_id = {
            let mut state = self.lock();
            let Some(execution_id) = state.step_owner.get(step_id).cloned() else {
                return;
            };
            let Some(step) = state
                .executions
                .get_mut(&execution_id)
                .and_then(|e| e.steps.iter_mut().find(|s| s.id == step_id))
            else {
                return;
            };
            if step.status != StepStatus::Pending {
                warn!(step_id, status = %step.status, "Ignoring start of non-pending step");
                return;
            }
            step.status = StepStatus::Running;
            step.timestamp = now;
            execution_id
        };

        self.emit(LedgerEvent::StepStarted {
            execution_id,
            step_id: step_id.to_string(),
        });
    }

    /// Finish a running step; `error` marks it failed
    ///
    /// A step completed straight from pending passes through running at the same
    /// instant, so its duration is zero.
    pub fn complete_step(&self, step_id: &str, output: Option<Value>, error: Option<ErrorDetail>) {
        if !self.settings.enabled {
            return;
        }

        let now = self.clock.now();
        let max = self.settings.max_payload_size;
        let (execution_id, workflow, step_name, status, duration) = {
            let mut state = self.lock();
            let Some(execution_id) = state.step_owner.get(step_id).cloned() else {
                return;
            };
            let Some(execution) = state.executions.get_mut(&execution_id) else {
                return;
            };
            let workflow = execution.name.clone();
            let Some(step) = execution.steps.iter_mut().find(|s| s.id == step_id) else {
                return;
            };
            if step.status.is_terminal() {
                warn!(step_id, status = %step.status, "Ignoring completion of finished step");
                return;
            }
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Running;
                step.timestamp = now;
            }

            let duration = elapsed_ms(step.timestamp, now);
            step.duration_ms = Some(duration);
            step.completed_at = Some(now);
            step.output = output.map(|v| truncate_payload(&v, max));
            step.status = if error.is_some() {
                StepStatus::Failed
            } else {
                StepStatus::Completed
            };
            step.error = error;
            (
                execution_id,
                workflow,
                step.name.clone(),
                step.status,
                duration,
            )
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_step(&workflow, &step_name, duration);
        }
        debug!(step_id, step = %step_name, status = %status, duration_ms = duration, "Step completed");
        self.emit(LedgerEvent::StepCompleted {
            execution_id,
            step_id: step_id.to_string(),
            status,
            duration_ms: duration,
        });
    }

    /// Begin tracking an LLM call made by a step; returns its id (empty when disabled)
    pub fn track_llm_call(&self, step_id: &str, call: NewLlmCall) -> String {
        if !self.settings.enabled {
            return String::new();
        }

        let call_id = Self::new_id();
        let now = self.clock.now();
        let model = call.model.clone();
        let execution_id = {
            let mut state = self.lock();
            let Some(execution_id) = state.step_owner.get(step_id).cloned() else {
                debug!(step_id, "track_llm_call on unknown step ignored");
                return String::new();
            };
            let Some(execution) = state.executions.get_mut(&execution_id) else {
                return String::new();
            };
            execution.llm_calls.push(LlmCall {
                id: call_id.clone(),
                step_id: step_id.to_string(),
                provider: call.provider,
                model: call.model,
                temperature: call.temperature,
                prompt: call.prompt,
                response: None,
                tokens: None,
                cost: None,
                started_at: now,
                latency_ms: None,
                cache_hit: false,
                cache_key: call.cache_key,
            });
            state
                .call_owner
                .insert(call_id.clone(), execution_id.clone());
            execution_id
        };

        self.emit(LedgerEvent::LlmCallStarted {
            execution_id,
            call_id: call_id.clone(),
            model,
        });
        call_id
    }

    /// Fill in the response of a tracked LLM call
    pub fn complete_llm_call(
        &self,
        call_id: &str,
        response: Value,
        tokens: Option<TokenUsage>,
        cost: Option<f64>,
        cache_hit: bool,
    ) {
        if !self.settings.enabled {
            return;
        }

        let now = self.clock.now();
        let (execution_id, workflow, model, latency) = {
            let mut state = self.lock();
            let Some(execution_id) = state.call_owner.get(call_id).cloned() else {
                return;
            };
            let Some(execution) = state.executions.get_mut(&execution_id) else {
                return;
            };
            let workflow = execution.name.clone();
            let Some(call) = execution.llm_calls.iter_mut().find(|c| c.id == call_id) else {
                return;
            };
            let latency = elapsed_ms(call.started_at, now);
            call.response = Some(response);
            call.tokens = tokens;
            call.cost = cost;
            call.cache_hit = cache_hit;
            call.latency_ms = Some(latency);
            (execution_id, workflow, call.model.clone(), latency)
        };

        if latency > self.settings.slow_llm_threshold_ms {
            warn!(
                call_id,
                model = %model,
                latency_ms = latency,
                threshold_ms = self.settings.slow_llm_threshold_ms,
                "Slow LLM call"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_llm_call(&workflow, cache_hit);
        }
        self.emit(LedgerEvent::LlmCallCompleted {
            execution_id,
            call_id: call_id.to_string(),
            latency_ms: latency,
            cache_hit,
        });
    }

    /// Begin tracking a database operation made by a step; returns its id (empty when disabled)
    pub fn track_database_operation(
        &self,
        step_id: &str,
        operation: DbOperationKind,
        table: &str,
        query: &str,
        params: Option<Value>,
    ) -> String {
        if !self.settings.enabled {
            return String::new();
        }

        let op_id = Self::new_id();
        let now = self.clock.now();
        let execution_id = {
            let mut state = self.lock();
            let Some(execution_id) = state.step_owner.get(step_id).cloned() else {
                debug!(step_id, "track_database_operation on unknown step ignored");
                return String::new();
            };
            let Some(execution) = state.executions.get_mut(&execution_id) else {
                return String::new();
            };
            execution.database_operations.push(DatabaseOperation {
                id: op_id.clone(),
                step_id: step_id.to_string(),
                operation,
                table: table.to_string(),
                query: query.to_string(),
                params,
                result: None,
                rows_affected: None,
                started_at: now,
                execution_time_ms: None,
                error: None,
            });
            state.op_owner.insert(op_id.clone(), execution_id.clone());
            execution_id
        };

        self.emit(LedgerEvent::DatabaseOperationStarted {
            execution_id,
            operation_id: op_id.clone(),
            table: table.to_string(),
            operation,
        });
        op_id
    }

    /// Fill in the outcome of a tracked database operation
    pub fn complete_database_operation(
        &self,
        op_id: &str,
        result: Option<Value>,
        rows_affected: Option<u64>,
        error: Option<String>,
    ) {
        if !self.settings.enabled {
            return;
        }

        let now = self.clock.now();
        let max = self.settings.max_payload_size;
        let (execution_id, table, operation, elapsed, failed) = {
            let mut state = self.lock();
            let Some(execution_id) = state.op_owner.get(op_id).cloned() else {
                return;
            };
            let Some(op) = state
                .executions
                .get_mut(&execution_id)
                .and_then(|e| e.database_operations.iter_mut().find(|o| o.id == op_id))
            else {
                return;
            };
            let elapsed = elapsed_ms(op.started_at, now);
            op.result = result.map(|v| truncate_payload(&v, max));
            op.rows_affected = rows_affected;
            op.execution_time_ms = Some(elapsed);
            let failed = error.is_some();
            op.error = error;
            (execution_id, op.table.clone(), op.operation, elapsed, failed)
        };

        if elapsed > self.settings.slow_query_threshold_ms {
            warn!(
                op_id,
                table = %table,
                operation = %operation,
                execution_time_ms = elapsed,
                threshold_ms = self.settings.slow_query_threshold_ms,
                "Slow database operation"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_db_operation(&table, &operation.to_string());
        }
        self.emit(LedgerEvent::DatabaseOperationCompleted {
            execution_id,
            operation_id: op_id.to_string(),
            execution_time_ms: elapsed,
            failed,
        });
    }

    /// Flip a running execution to paused or back
    pub fn set_execution_status(&self, execution_id: &str, status: ExecutionStatus) {
        if !self.settings.enabled {
            return;
        }
        {
            let mut state = self.lock();
            let Some(execution) = state.executions.get_mut(execution_id) else {
                return;
            };
            if execution.end_time.is_some() {
                return;
            }
            execution.status = status;
        }
        self.emit(LedgerEvent::WorkflowStatusChanged {
            execution_id: execution_id.to_string(),
            status,
        });
    }

    /// Finalize an execution: end time, total cost, status
    pub fn complete_workflow(
        &self,
        execution_id: &str,
        output: Option<Value>,
        error: Option<ErrorDetail>,
    ) {
        if !self.settings.enabled {
            return;
        }

        let now = self.clock.now();
        let max = self.settings.max_payload_size;
        let (name, status, duration) = {
            let mut state = self.lock();
            let Some(execution) = state.executions.get_mut(execution_id) else {
                return;
            };
            if execution.end_time.is_some() {
                warn!(execution_id, "Execution already completed");
                return;
            }
            let duration = elapsed_ms(execution.start_time, now);
            execution.end_time = Some(now);
            execution.total_duration_ms = Some(duration);
            execution.total_cost = execution.llm_calls.iter().filter_map(|c| c.cost).sum();
            execution.output = output.map(|v| truncate_payload(&v, max));
            execution.status = if error.is_some() {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
            execution.error = error;
            (execution.name.clone(), execution.status, duration)
        };

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_executions();
            metrics.record_workflow_execution(&name, &status.to_string());
        }
        info!(execution_id, workflow = %name, status = %status, duration_ms = duration, "Workflow completed");
        self.emit(LedgerEvent::WorkflowCompleted {
            execution_id: execution_id.to_string(),
            status,
            duration_ms: duration,
        });
    }

    /// Derive timing metrics and the top bottlenecks of an execution
    pub fn get_performance_metrics(&self, execution_id: &str) -> Option<PerformanceMetrics> {
        if !self.settings.enabled {
            return None;
        }

        let now = self.clock.now();
        let state = self.lock();
        let execution = state.executions.get(execution_id)?;
        let total = execution
            .total_duration_ms
            .unwrap_or_else(|| elapsed_ms(execution.start_time, now));

        let step_durations: BTreeMap<_, _> = execution
            .steps
            .iter()
            .filter_map(|s| s.duration_ms.map(|d| (s.id.clone(), d)))
            .collect();
        let llm_latencies: BTreeMap<_, _> = execution
            .llm_calls
            .iter()
            .filter_map(|c| c.latency_ms.map(|d| (c.id.clone(), d)))
            .collect();
        let db_timings: BTreeMap<_, _> = execution
            .database_operations
            .iter()
            .filter_map(|o| o.execution_time_ms.map(|d| (o.id.clone(), d)))
            .collect();

        let percentage = |d: u64| {
            if total == 0 {
                0.0
            } else {
                d as f64 / total as f64 * 100.0
            }
        };

        let mut bottlenecks: Vec<Bottleneck> = Vec::new();
        for step in &execution.steps {
            if let Some(d) = step.duration_ms {
                bottlenecks.push(Bottleneck {
                    kind: BottleneckKind::Step,
                    id: step.id.clone(),
                    label: step.name.clone(),
                    duration_ms: d,
                    percentage: percentage(d),
                });
            }
        }
        for call in &execution.llm_calls {
            if let Some(d) = call.latency_ms {
                bottlenecks.push(Bottleneck {
                    kind: BottleneckKind::LlmCall,
                    id: call.id.clone(),
                    label: format!("{}/{}", call.provider, call.model),
                    duration_ms: d,
                    percentage: percentage(d),
                });
            }
        }
        for op in &execution.database_operations {
            if let Some(d) = op.execution_time_ms {
                bottlenecks.push(Bottleneck {
                    kind: BottleneckKind::DatabaseOperation,
                    id: op.id.clone(),
                    label: format!("{} {}", op.operation, op.table),
                    duration_ms: d,
                    percentage: percentage(d),
                });
            }
        }
        bottlenecks.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        bottlenecks.truncate(BOTTLENECK_LIMIT);

        Some(PerformanceMetrics {
            execution_id: execution_id.to_string(),
            total_duration_ms: total,
            total_cost: execution.llm_calls.iter().filter_map(|c| c.cost).sum(),
            step_durations,
            llm_latencies,
            db_timings,
            cache_hits: execution.llm_calls.iter().filter(|c| c.cache_hit).count(),
            bottlenecks,
        })
    }

    /// Snapshot of one execution
    pub fn export_execution(&self, execution_id: &str) -> Option<Execution> {
        if !self.settings.enabled {
            return None;
        }
        self.lock().executions.get(execution_id).cloned()
    }

    /// Snapshot of every execution, oldest first
    pub fn get_all_executions(&self) -> Vec<Execution> {
        if !self.settings.enabled {
            return Vec::new();
        }
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.executions.get(id).cloned())
            .collect()
    }

    /// Ids of executions that have not completed
    pub fn active_executions(&self) -> Vec<String> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .executions
                    .get(*id)
                    .is_some_and(|e| e.end_time.is_none())
            })
            .cloned()
            .collect()
    }

    /// Drop every recorded execution
    pub fn clear(&self) {
        *self.lock() = LedgerState::default();
    }
}

/// Render a one-screen console summary of an execution
pub fn render_summary(execution: &Execution, metrics: Option<&PerformanceMetrics>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Execution {} [{}] {}\n",
        execution.name, execution.status, execution.id
    ));
    out.push_str(&format!(
        "  environment: {}  duration: {}ms  cost: ${:.4}\n",
        execution.environment,
        execution.total_duration_ms.unwrap_or(0),
        execution.total_cost
    ));
    out.push_str(&format!(
        "  steps: {}  llm calls: {}  db operations: {}\n",
        execution.steps.len(),
        execution.llm_calls.len(),
        execution.database_operations.len()
    ));
    for step in &execution.steps {
        out.push_str(&format!(
            "    - {} ({}) {} {}ms\n",
            step.name,
            step.step_type,
            step.status,
            step.duration_ms.unwrap_or(0)
        ));
    }
    if let Some(error) = &execution.error {
        out.push_str(&format!("  error: {}\n", error.message));
    }
    if let Some(metrics) = metrics {
        if !metrics.bottlenecks.is_empty() {
            out.push_str("  bottlenecks:\n");
            for b in &metrics.bottlenecks {
                out.push_str(&format!(
                    "    {} {}ms ({:.1}%)\n",
                    b.label, b.duration_ms, b.percentage
                ));
            }
        }
    }
    out
}
