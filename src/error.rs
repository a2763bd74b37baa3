//! Error types for FlowProbe

use thiserror::Error;

/// FlowProbe error types
#[derive(Error, Debug)]
pub enum FlowProbeError {
    /// Invalid or missing configuration, never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Snapshot id unknown in memory and in durable storage
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Execution id unknown to the ledger
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Scenario id not registered
    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    /// Table not in the managed table set
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Scenario workflow exceeded its wall-clock budget
    #[error("Scenario '{scenario}' timed out after {timeout_ms}ms")]
    ScenarioTimeout { scenario: String, timeout_ms: u64 },

    /// Scenario definition failed validation
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias using FlowProbeError
pub type Result<T> = std::result::Result<T, FlowProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_format() {
        let err = FlowProbeError::ScenarioTimeout {
            scenario: "checkout".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Scenario 'checkout' timed out after 250ms");
    }

    #[test]
    fn test_snapshot_not_found_message() {
        let err = FlowProbeError::SnapshotNotFound("abc".to_string());
        assert_eq!(err.to_string(), "Snapshot not found: abc");
    }
}
