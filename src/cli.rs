//! CLI interface for FlowProbe
//!
//! The commands operate on persisted harness artifacts: the response cache directory,
//! database snapshots and scenario files.

use crate::cache::CacheEntry;
use crate::config::HarnessConfig;
use crate::environment::DbMode;
use crate::orchestrator::Orchestrator;
use crate::scenario::{is_scenario_file, parse_scenario_file};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// FlowProbe - Workflow debugging harness
#[derive(Parser, Debug)]
#[command(name = "flowprobe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Record, cache, snapshot and replay workflow executions", long_about = None)]
pub struct Cli {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty); overrides the config file
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// LLM response cache commands
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Database snapshot commands
    Snapshot {
        /// Database to operate on
        #[arg(short, long, value_enum, global = true)]
        mode: Option<ModeArg>,

        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Test scenario commands
    Scenario {
        #[command(subcommand)]
        command: ScenarioCommands,
    },

    /// Print Prometheus metrics, or serve them over HTTP
    ///
    /// Counters only cover this process; the cache and snapshot gauges reflect what is
    /// persisted on disk.
    Metrics {
        /// Serve `/metrics` on this port until interrupted
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as YAML
    Show,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show entry count and persisted size
    Stats,

    /// Remove cached responses
    Clear {
        /// Only entries of this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Only entries of this step (requires --workflow)
        #[arg(short, long, requires = "workflow")]
        step: Option<String>,
    },

    /// Delete expired and unreadable cache files
    Prune,

    /// Write all unexpired entries to a JSON file
    Export {
        /// Output file
        output: PathBuf,
    },

    /// Merge entries from a JSON export
    Import {
        /// Input file
        input: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Capture every managed table
    Create {
        /// Snapshot name
        name: String,

        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Replace table contents with a snapshot
    Restore {
        /// Snapshot id
        id: String,
    },

    /// List stored snapshots
    List,

    /// Delete a snapshot
    Delete {
        /// Snapshot id
        id: String,
    },

    /// Restore the latest clean-state snapshot, or empty every table
    Reset,
}

#[derive(Subcommand, Debug)]
pub enum ScenarioCommands {
    /// Parse and validate a scenario file
    Validate {
        /// Scenario file (JSON or YAML)
        path: PathBuf,
    },

    /// List the scenarios found in a directory
    List {
        /// Directory to scan (defaults to scenarios.directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

/// Database selection for snapshot commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Production,
    Test,
}

impl From<ModeArg> for DbMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Production => DbMode::Production,
            ModeArg::Test => DbMode::Test,
        }
    }
}

impl Cli {
    /// Load the harness configuration named by `--config`
    pub fn load_config(&self) -> anyhow::Result<HarnessConfig> {
        Ok(HarnessConfig::load(self.config.as_deref())?)
    }

    /// Execute the CLI command
    pub async fn execute(&self, config: HarnessConfig) -> anyhow::Result<()> {
        match &self.command {
            Commands::Config { command } => match command {
                ConfigCommands::Show => {
                    print!("{}", serde_yaml::to_string(&config)?);
                }
            },
            Commands::Cache { command } => {
                self.handle_cache_command(config, command)?;
            }
            Commands::Snapshot { mode, command } => {
                self.handle_snapshot_command(config, *mode, command)?;
            }
            Commands::Scenario { command } => {
                self.handle_scenario_command(&config, command)?;
            }
            Commands::Metrics { port } => {
                self.handle_metrics(config, *port).await?;
            }
        }

        Ok(())
    }

    /// Handle cache management commands
    fn handle_cache_command(
        &self,
        config: HarnessConfig,
        command: &CacheCommands,
    ) -> anyhow::Result<()> {
        if !config.llm_cache.persist {
            warn!("llm_cache.persist is disabled; cache commands see an empty cache");
        }
        let cache_dir = config.llm_cache.directory.clone();
        let orchestrator = Orchestrator::from_config(config)?;
        let cache = orchestrator.cache();

        match command {
            CacheCommands::Stats => {
                let (files, bytes) = directory_usage(&cache_dir)?;
                println!("Cache directory: {}", cache_dir.display());
                println!("Entries:         {}", cache.len());
                println!("Files:           {}", files);
                println!("Size:            {}", format_bytes(bytes));
            }
            CacheCommands::Clear { workflow, step } => match workflow {
                Some(workflow) => {
                    let removed = cache.invalidate(workflow, step.as_deref());
                    println!("Removed {} cached responses", removed);
                }
                None => {
                    let count = cache.len();
                    cache.clear();
                    println!("Removed {} cached responses", count);
                }
            },
            CacheCommands::Prune => {
                let removed = cache.prune_store();
                println!("Pruned {} cache files", removed);
            }
            CacheCommands::Export { output } => {
                let entries = cache.export();
                std::fs::write(output, serde_json::to_string_pretty(&entries)?)?;
                info!("Exported {} entries to {:?}", entries.len(), output);
                println!("Exported {} entries to {}", entries.len(), output.display());
            }
            CacheCommands::Import { input } => {
                let content = std::fs::read_to_string(input)?;
                let entries: BTreeMap<String, CacheEntry> = serde_json::from_str(&content)?;
                let count = cache.import(entries);
                println!("Imported {} entries from {}", count, input.display());
            }
        }

        Ok(())
    }

    /// Handle snapshot commands
    fn handle_snapshot_command(
        &self,
        mut config: HarnessConfig,
        mode: Option<ModeArg>,
        command: &SnapshotCommands,
    ) -> anyhow::Result<()> {
        if let Some(mode) = mode {
            config.database.use_test_db = mode == ModeArg::Test;
        }
        let orchestrator = Orchestrator::from_config(config)?;
        let environment = orchestrator.environment();
        info!("Operating on the {} database", environment.mode());

        match command {
            SnapshotCommands::Create { name, description } => {
                let id = environment.create_snapshot(name, description.as_deref())?;
                println!("Created snapshot '{}' ({})", name, id);
            }
            SnapshotCommands::Restore { id } => {
                environment.restore_snapshot(id)?;
                println!("Restored snapshot {}", id);
            }
            SnapshotCommands::List => {
                let snapshots = environment.list_snapshots();
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }

                println!(
                    "{:<38} {:<20} {:<8} {:<8} {:<10} {:<20}",
                    "ID", "Name", "Tables", "Rows", "Size", "Created"
                );
                println!("{}", "-".repeat(108));

                for snapshot in snapshots {
                    let created = snapshot
                        .created_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string();
                    println!(
                        "{:<38} {:<20} {:<8} {:<8} {:<10} {:<20}",
                        snapshot.id,
                        snapshot.name,
                        snapshot.metadata.table_count,
                        snapshot.metadata.row_count,
                        format_bytes(snapshot.metadata.size_bytes as u64),
                        created
                    );
                }
            }
            SnapshotCommands::Delete { id } => {
                if environment.delete_snapshot(id)? {
                    println!("Deleted snapshot {}", id);
                } else {
                    println!("Snapshot {} not found", id);
                }
            }
            SnapshotCommands::Reset => {
                environment.reset_to_clean_state()?;
                println!("{} database reset to clean state", environment.mode());
            }
        }

        Ok(())
    }

    /// Handle scenario commands
    fn handle_scenario_command(
        &self,
        config: &HarnessConfig,
        command: &ScenarioCommands,
    ) -> anyhow::Result<()> {
        match command {
            ScenarioCommands::Validate { path } => {
                let scenarios = parse_scenario_file(path)?;
                for scenario in &scenarios {
                    println!(
                        "Scenario '{}' is valid ({} assertions)",
                        scenario.id,
                        scenario.assertions.len()
                    );
                }
            }
            ScenarioCommands::List { dir } => {
                let dir = dir.as_ref().unwrap_or(&config.scenarios.directory);
                let files = scenario_files(dir)?;

                println!(
                    "{:<24} {:<30} {:<20} {:<6} {:<20}",
                    "ID", "Name", "Workflow", "Checks", "Tags"
                );
                println!("{}", "-".repeat(104));

                let mut found = 0;
                for path in files {
                    let scenarios = match parse_scenario_file(&path) {
                        Ok(scenarios) => scenarios,
                        Err(e) => {
                            warn!("Skipping {:?}: {}", path, e);
                            continue;
                        }
                    };
                    for scenario in scenarios {
                        found += 1;
                        println!(
                            "{:<24} {:<30} {:<20} {:<6} {:<20}",
                            scenario.id,
                            scenario.name,
                            scenario.workflow_name,
                            scenario.assertions.len(),
                            scenario.tags.join(",")
                        );
                    }
                }

                if found == 0 {
                    println!("No scenarios found in {}", dir.display());
                }
            }
        }

        Ok(())
    }

    /// Print or serve the metrics registry
    async fn handle_metrics(&self, config: HarnessConfig, port: Option<u16>) -> anyhow::Result<()> {
        let orchestrator = Orchestrator::from_config(config)?;
        let metrics = orchestrator.metrics().clone();

        match port {
            Some(port) => {
                metrics.serve(port).await?;
                println!("Serving metrics on http://127.0.0.1:{}/metrics (Ctrl-C to stop)", port);
                tokio::signal::ctrl_c().await?;
                info!("Shutting down metrics server");
            }
            None => print!("{}", metrics.render()?),
        }

        Ok(())
    }
}

/// Scenario files directly under `dir`, sorted by name
fn scenario_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_scenario_file(path))
        .collect();
    files.sort();
    Ok(files)
}

/// File count and total bytes below `dir`
fn directory_usage(dir: &Path) -> anyhow::Result<(usize, u64)> {
    if !dir.exists() {
        return Ok((0, 0));
    }

    let mut files = 0;
    let mut bytes = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            let (f, b) = directory_usage(&entry.path())?;
            files += f;
            bytes += b;
        } else {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

/// Format a byte count to human-readable string
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
