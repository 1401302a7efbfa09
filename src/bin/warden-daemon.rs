use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use warden::daemon::{
    Daemon, DaemonManager, DaemonOptions, PidFile, DEFAULT_LOG_DIR, DEFAULT_PID_FILE,
};
use warden::ipc::DEFAULT_SOCKET_PATH;

/// warden-daemon - host the supervisor loop behind a Unix socket
#[derive(Parser)]
#[command(name = "warden-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the .json or .toml ecosystem file
    #[arg(short, long)]
    config: PathBuf,

    /// Path to the Unix socket to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Path to the PID file
    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Directory for captured process output
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let daemon_manager = DaemonManager::with_pid_file(PidFile::with_path(&args.pid_file));
    daemon_manager
        .register_daemon()
        .context("Failed to register daemon")?;

    let options = DaemonOptions {
        config_path: args.config,
        socket_path: args.socket,
        log_dir: args.log_dir,
    };

    let result = run(&options).await;

    daemon_manager
        .unregister_daemon()
        .context("Failed to remove PID file")?;

    result
}

async fn run(options: &DaemonOptions) -> anyhow::Result<()> {
    let daemon = Daemon::start(options)
        .await
        .with_context(|| format!("Failed to start from {}", options.config_path.display()))?;

    tracing::info!(
        "warden daemon started (PID: {}), listening on {}",
        std::process::id(),
        daemon.socket_path().display()
    );

    daemon.run().await?;
    Ok(())
}
