use clap::Parser;
use flowprobe::cli::Cli;
use flowprobe::logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = cli.load_config()?;

    // Initialize logging; CLI flags win over the config file
    let log_config = LogConfig::from(&config.logging)
        .with_overrides(cli.log_level.as_deref(), cli.log_format.as_deref());
    init_logging(&log_config)?;

    // Execute command
    cli.execute(config).await?;

    Ok(())
}
