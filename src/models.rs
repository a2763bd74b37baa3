//! Core data models for the FlowProbe execution ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker appended to payloads cut down to the configured byte budget
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    LlmCall,
    DatabaseOperation,
    ApiCall,
    DecisionPoint,
    ToolExecution,
    UserInteraction,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::LlmCall => write!(f, "llm_call"),
            StepType::DatabaseOperation => write!(f, "database_operation"),
            StepType::ApiCall => write!(f, "api_call"),
            StepType::DecisionPoint => write!(f, "decision_point"),
            StepType::ToolExecution => write!(f, "tool_execution"),
            StepType::UserInteraction => write!(f, "user_interaction"),
        }
    }
}

/// Step status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// True once the step can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Database operation kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DbOperationKind {
    Select,
    Insert,
    Update,
    Delete,
    Upsert,
}

impl std::fmt::Display for DbOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbOperationKind::Select => write!(f, "select"),
            DbOperationKind::Insert => write!(f, "insert"),
            DbOperationKind::Update => write!(f, "update"),
            DbOperationKind::Delete => write!(f, "delete"),
            DbOperationKind::Upsert => write!(f, "upsert"),
        }
    }
}

/// Error detail recorded on steps and executions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Build from an `anyhow` error, keeping the cause chain when `include_stack` is set
    pub fn from_anyhow(err: &anyhow::Error, include_stack: bool) -> Self {
        Self {
            message: err.to_string(),
            stack: include_stack.then(|| format!("{:?}", err)),
        }
    }
}

/// Token accounting for one LLM call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Read an OpenAI-style `usage` object from a response payload
    pub fn from_response(response: &Value) -> Option<Self> {
        let usage = response.get("usage")?;
        let prompt_tokens = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion_tokens = usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let total_tokens = usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(prompt_tokens + completion_tokens);
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }
}

/// A named unit of work within an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Time of the most recent transition (creation, then start)
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// One tracked LLM request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmCall {
    pub id: String,
    pub step_id: String,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

/// One tracked database operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseOperation {
    pub id: String,
    pub step_id: String,
    pub operation: DbOperationKind,
    pub table: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One tracked run of a named workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub correlation_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub steps: Vec<Step>,
    pub llm_calls: Vec<LlmCall>,
    pub database_operations: Vec<DatabaseOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    pub total_cost: f64,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl Execution {
    /// Find a step by name (first match)
    pub fn step_named(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Find a step by id
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Name of the step a call or operation belongs to
    pub fn step_name_of(&self, step_id: &str) -> Option<&str> {
        self.step(step_id).map(|s| s.name.as_str())
    }
}

/// Cut a payload down to `max_bytes` of serialized JSON
///
/// Returns the payload unchanged when it fits, otherwise a string holding the leading
/// bytes followed by [`TRUNCATION_MARKER`].
pub fn truncate_payload(value: &Value, max_bytes: usize) -> Value {
    let serialized = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if serialized.len() <= max_bytes {
        return value.clone();
    }

    let mut cut = max_bytes;
    while cut > 0 && !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}{}", &serialized[..cut], TRUNCATION_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_display() {
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
        assert_eq!(ExecutionStatus::Failed.to_string(), "failed");
        assert_eq!(StepStatus::Pending.to_string(), "pending");
        assert_eq!(StepStatus::Skipped.to_string(), "skipped");
        assert_eq!(DbOperationKind::Upsert.to_string(), "upsert");
        assert_eq!(StepType::DecisionPoint.to_string(), "decision_point");
    }

    #[test]
    fn test_step_type_serde() {
        let t: StepType = serde_json::from_str("\"llm_call\"").unwrap();
        assert_eq!(t, StepType::LlmCall);
        let t: StepType = serde_json::from_str("\"tool_execution\"").unwrap();
        assert_eq!(t, StepType::ToolExecution);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_truncate_payload_small_is_unchanged() {
        let value = json!({"a": 1});
        assert_eq!(truncate_payload(&value, 100), value);
    }

    #[test]
    fn test_truncate_payload_large() {
        let value = json!("x".repeat(50));
        let truncated = truncate_payload(&value, 10);
        let s = truncated.as_str().unwrap();
        assert_eq!(s, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let value = json!("ééééé");
        let truncated = truncate_payload(&value, 3);
        assert!(truncated.as_str().unwrap().ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_token_usage_from_response() {
        let response = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}});
        let usage = TokenUsage::from_response(&response).unwrap();
        assert_eq!(usage.total_tokens, 15);
        assert!(TokenUsage::from_response(&json!({"text": "hi"})).is_none());
    }

    #[test]
    fn test_execution_equality_covers_nested_records() {
        let raw = json!({
            "id": "e1",
            "name": "wf",
            "trigger": "manual",
            "correlation_id": "c1",
            "start_time": "2026-01-01T00:00:00Z",
            "status": "completed",
            "steps": [{
                "id": "s1",
                "name": "classify",
                "type": "llm_call",
                "timestamp": "2026-01-01T00:00:00Z",
                "status": "completed"
            }],
            "llm_calls": [{
                "id": "l1",
                "step_id": "s1",
                "provider": "openai",
                "model": "gpt-4",
                "prompt": "hi",
                "started_at": "2026-01-01T00:00:00Z",
                "cache_hit": false
            }],
            "database_operations": [{
                "id": "d1",
                "step_id": "s1",
                "operation": "select",
                "table": "users",
                "query": "select",
                "started_at": "2026-01-01T00:00:00Z"
            }],
            "total_cost": 0.0,
            "environment": "test"
        });
        let execution: Execution = serde_json::from_value(raw).unwrap();
        assert_eq!(execution, execution.clone());

        let mut changed = execution.clone();
        changed.llm_calls[0].cache_hit = true;
        assert_ne!(execution, changed);

        let mut changed = execution.clone();
        changed.database_operations[0].rows_affected = Some(1);
        assert_ne!(execution, changed);
    }
}
