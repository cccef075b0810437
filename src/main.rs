use pubsub_runtime::cli::{commands, Cli};
use pubsub_runtime::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();
    let config = cli.global.load_config()?;

    // Initialize tracing
    init_tracing(&config.logging)?;

    // Execute the command
    commands::execute_command(config, cli.command).await?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
    }
    Ok(())
}
