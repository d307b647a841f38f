use anyhow::Context;
use clap::Parser;
use interface_tester::daemon::{self, DaemonOptions, DaemonPaths};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "interface-tester")]
#[command(about = "Per-interface connectivity testing daemon")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Path to the bus socket
    #[arg(short = 's', long = "socket")]
    socket: PathBuf,

    /// Path to the test executable directory
    #[arg(short = 'S', long = "test-dir", default_value = ".")]
    test_dir: PathBuf,

    /// Path to the recovery executable directory
    #[arg(short = 'r', long = "recovery-dir", default_value = ".")]
    recovery_dir: PathBuf,

    /// Logging threshold (e.g. "info", "interface_tester=debug")
    #[arg(short = 't', long = "log-threshold", default_value = "info")]
    log_threshold: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_threshold)
        .context("invalid logging threshold")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = DaemonOptions {
        socket_path: cli.socket,
        paths: DaemonPaths {
            test_dir: cli.test_dir,
            recovery_dir: cli.recovery_dir,
            config_file: cli.config,
        },
    };

    daemon::run(options).await.context("interface tester failed")?;
    Ok(())
}
