use anyhow::Context;
use clap::Parser;
use interface_tester::configurator::{self, ConfiguratorOptions};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "configurator")]
#[command(about = "Feeds the interface tester its configuration and runs the operator notifier")]
#[command(version)]
struct Cli {
    /// Path to the bus socket
    #[arg(short = 's', long = "socket")]
    socket: PathBuf,

    /// Path to the configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Path to the event processor executable
    #[arg(short = 'e', long = "event-processor")]
    event_processor: Option<PathBuf>,

    /// Logging threshold
    #[arg(short = 't', long = "log-threshold", default_value = "info")]
    log_threshold: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_threshold)
        .context("invalid logging threshold")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = ConfiguratorOptions {
        socket_path: cli.socket,
        config_file: cli.config,
        event_processor: cli.event_processor,
    };

    configurator::run(options).await.context("configurator failed")?;
    Ok(())
}
