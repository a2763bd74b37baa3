//! Structured logging using tracing
//!
//! Level and format come from the `logging` section of the harness configuration; the
//! CLI flags `--log-level` / `--log-format` take precedence when given.

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Resolved subscriber settings
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from(&LoggingConfig::default())
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            level: config.level.as_str().into(),
            format: config.format.as_str().into(),
        }
    }
}

impl LogConfig {
    /// Apply command-line overrides
    pub fn with_overrides(mut self, level: Option<&str>, format: Option<&str>) -> Self {
        if let Some(level) = level {
            self.level = level.into();
        }
        if let Some(format) = format {
            self.format = format.into();
        }
        self
    }
}

/// Install the global subscriber, writing to stderr
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let level: Level = config.level.into();

    match config.format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .json()
                .with_max_level(level)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        let level: LogLevel = "error".into();
        assert_eq!(level, LogLevel::Error);

        let level: LogLevel = "WARNING".into();
        assert_eq!(level, LogLevel::Warn);

        // Unknown defaults to Info
        let level: LogLevel = "verbose".into();
        assert_eq!(level, LogLevel::Info);
    }

    #[test]
    fn test_log_config_from_harness_config() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            ..Default::default()
        };
        let config = LogConfig::from(&logging);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);

        let default = LogConfig::default();
        assert_eq!(default.level, LogLevel::Info);
        assert_eq!(default.format, LogFormat::Pretty);
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = LogConfig::default().with_overrides(Some("trace"), Some("json"));
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Json);

        let untouched = LogConfig::default().with_overrides(None, None);
        assert_eq!(untouched.level, LogLevel::Info);
    }
}
