//! Harness configuration
//!
//! Every subsystem reads its knobs from [`HarnessConfig`]. Values come from an optional
//! file (YAML, JSON or TOML, picked by extension) overlaid by `FLOWPROBE__*` environment
//! variables, e.g. `FLOWPROBE__LLM_CACHE__TTL_MS=60000`.

use crate::error::{FlowProbeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Operating mode of the harness
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HarnessMode {
    #[default]
    Development,
    Test,
    Production,
}

impl std::fmt::Display for HarnessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessMode::Development => write!(f, "development"),
            HarnessMode::Test => write!(f, "test"),
            HarnessMode::Production => write!(f, "production"),
        }
    }
}

/// Prompt hashing strategy used for cache keys
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    /// Length plus leading/trailing affixes
    Simple,
    /// Rolling hash over every character
    #[default]
    Full,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Master switch; when false all instrumentation is a pass-through
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: HarnessMode,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm_cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub scenarios: ScenarioConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: HarnessMode::default(),
            database: DatabaseConfig::default(),
            llm_cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            performance: PerformanceConfig::default(),
            scenarios: ScenarioConfig::default(),
        }
    }
}

/// Backing store selection and snapshot location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub use_test_db: bool,
    #[serde(default = "default_production_path")]
    pub production_path: PathBuf,
    #[serde(default = "default_test_path")]
    pub test_path: PathBuf,
    /// Tables captured by snapshots and cleared on restore
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_directory: PathBuf,
    /// Route every query through the timing interceptor
    #[serde(default = "default_true")]
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            use_test_db: false,
            production_path: default_production_path(),
            test_path: default_test_path(),
            tables: default_tables(),
            snapshot_directory: default_snapshot_dir(),
            log_queries: true,
        }
    }
}

/// LLM response cache behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(default)]
    pub hash_function: HashFunction,
    /// Write entries through to `directory`
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_cache_dir(),
            ttl_ms: default_ttl_ms(),
            max_cache_size: default_max_cache_size(),
            hash_function: HashFunction::default(),
            persist: true,
        }
    }
}

/// Verbosity and payload truncation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub include_stacks: bool,
    /// Byte budget for recorded step payloads
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_stacks: false,
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// Warning thresholds, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_threshold_ms: u64,
    #[serde(default = "default_slow_llm_ms")]
    pub slow_llm_threshold_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: default_slow_query_ms(),
            slow_llm_threshold_ms: default_slow_llm_ms(),
        }
    }
}

/// Scenario discovery and execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_scenario_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_scenario_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            directory: default_scenario_dir(),
            timeout_ms: default_scenario_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_production_path() -> PathBuf {
    PathBuf::from(".flowprobe/production.db")
}

fn default_test_path() -> PathBuf {
    PathBuf::from(".flowprobe/test.db")
}

fn default_tables() -> Vec<String> {
    ["projects", "artifacts", "analyses", "strategy_patches", "campaign_results"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".flowprobe/snapshots")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".flowprobe/cache")
}

fn default_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_max_cache_size() -> usize {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_payload_size() -> usize {
    10_000
}

fn default_slow_query_ms() -> u64 {
    1_000
}

fn default_slow_llm_ms() -> u64 {
    5_000
}

fn default_scenario_dir() -> PathBuf {
    PathBuf::from("scenarios")
}

fn default_scenario_timeout_ms() -> u64 {
    30_000
}

impl HarnessConfig {
    /// Load configuration from an optional file overlaid by `FLOWPROBE__*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FLOWPROBE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: HarnessConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.llm_cache.max_cache_size == 0 {
            return Err(FlowProbeError::Config(
                "llm_cache.max_cache_size must be at least 1".to_string(),
            ));
        }
        if self.llm_cache.ttl_ms == 0 {
            return Err(FlowProbeError::Config(
                "llm_cache.ttl_ms must be greater than 0".to_string(),
            ));
        }
        if self.mode == HarnessMode::Production && self.database.use_test_db {
            return Err(FlowProbeError::Config(
                "database.use_test_db cannot be enabled in production mode".to_string(),
            ));
        }
        if self.database.tables.is_empty() {
            return Err(FlowProbeError::Config(
                "database.tables must name at least one table".to_string(),
            ));
        }
        Ok(())
    }

    /// Configuration suited to unit and integration tests: test database, no file persistence
    pub fn for_tests() -> Self {
        let mut config = Self {
            mode: HarnessMode::Test,
            ..Self::default()
        };
        config.database.use_test_db = true;
        config.llm_cache.persist = false;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = HarnessConfig::default();
        assert!(config.enabled);
        assert_eq!(config.mode, HarnessMode::Development);
        assert_eq!(config.llm_cache.ttl_ms, 86_400_000);
        assert_eq!(config.llm_cache.max_cache_size, 1_000);
        assert_eq!(config.llm_cache.hash_function, HashFunction::Full);
        assert_eq!(config.logging.max_payload_size, 10_000);
        assert_eq!(config.performance.slow_query_threshold_ms, 1_000);
        assert_eq!(config.scenarios.timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_config() {
        let yaml = r#"
mode: test
llm_cache:
  ttl_ms: 1000
  hash_function: simple
database:
  use_test_db: true
  tables: [projects]
"#;
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, HarnessMode::Test);
        assert_eq!(config.llm_cache.ttl_ms, 1000);
        assert_eq!(config.llm_cache.hash_function, HashFunction::Simple);
        assert_eq!(config.llm_cache.max_cache_size, 1_000);
        assert_eq!(config.database.tables, vec!["projects".to_string()]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "enabled: false\nperformance:\n  slow_llm_threshold_ms: 42").unwrap();

        let config = HarnessConfig::load(Some(file.path())).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.performance.slow_llm_threshold_ms, 42);
    }

    #[test]
    fn test_production_with_test_db_rejected() {
        let mut config = HarnessConfig::default();
        config.mode = HarnessMode::Production;
        config.database.use_test_db = true;
        assert!(matches!(config.validate(), Err(FlowProbeError::Config(_))));
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let mut config = HarnessConfig::default();
        config.llm_cache.max_cache_size = 0;
        assert!(config.validate().is_err());
    }
}
