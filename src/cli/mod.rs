// CLI module - User-facing command-line interface

mod output;

use crate::daemon::{DaemonManager, PidFile, StopOutcome, DEFAULT_LOG_DIR, DEFAULT_PID_FILE};
use crate::error::{exit_code, Result, WardenError};
use crate::ipc::{Command, IpcClient, DEFAULT_SOCKET_PATH};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the daemon binary, expected next to the CLI binary
const DAEMON_BINARY: &str = "warden-daemon";

/// How long `daemon start` waits for the socket to appear
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `daemon stop` waits before killing an unresponsive daemon
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// warden - supervise a fleet of local application processes
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the daemon's Unix socket
    #[arg(long, global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Path to the daemon's PID file
    #[arg(long, global = true, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every instance of an application
    Start {
        /// Application name from the ecosystem file
        name: String,
    },

    /// Stop every instance of an application
    Stop {
        /// Application name from the ecosystem file
        name: String,
    },

    /// Replace every instance of an application with a fresh process
    Restart {
        /// Application name from the ecosystem file
        name: String,
    },

    /// Re-read an ecosystem file and apply the differences
    Reload {
        /// Path to the .json or .toml ecosystem file
        config: PathBuf,
    },

    /// Show every instance slot
    Status,

    /// Check that the daemon answers
    Ping,

    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start {
        /// Path to the .json or .toml ecosystem file
        config: PathBuf,

        /// Directory for captured process output
        #[arg(long, default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,
    },
    /// Stop every instance, then the daemon
    Stop,
    /// Check daemon status
    Status,
}

impl Cli {
    /// Run the CLI application, returning the process exit code
    pub fn run() -> Result<i32> {
        let cli = Cli::parse();
        cli.execute()
    }

    /// Execute the parsed command
    fn execute(&self) -> Result<i32> {
        if let Commands::Daemon { command } = &self.command {
            return self.execute_daemon(command);
        }

        let command = self.build_command()?;
        self.send(command)
    }

    /// Send one command and print the reply
    fn send(&self, command: Command) -> Result<i32> {
        let client = IpcClient::with_socket_path(&self.socket);
        let response = client.send_command(command)?;

        match &response.result {
            Ok(data) => output::print_success(data),
            Err(error) => output::print_error(&error.message),
        }

        Ok(response.exit_code())
    }

    /// Build an IPC command from the CLI arguments
    fn build_command(&self) -> Result<Command> {
        match &self.command {
            Commands::Start { name } => Ok(Command::Start { name: name.clone() }),
            Commands::Stop { name } => Ok(Command::Stop { name: name.clone() }),
            Commands::Restart { name } => Ok(Command::Restart { name: name.clone() }),
            Commands::Reload { config } => Ok(Command::Reload {
                config: canonical_config(config)?,
            }),
            Commands::Status => Ok(Command::Status),
            Commands::Ping => Ok(Command::Ping),
            Commands::Daemon { .. } => Err(WardenError::Other(
                "daemon commands are not sent over IPC".to_string(),
            )),
        }
    }

    fn execute_daemon(&self, command: &DaemonCommands) -> Result<i32> {
        let manager = DaemonManager::with_pid_file(PidFile::with_path(&self.pid_file));

        match command {
            DaemonCommands::Start { config, log_dir } => {
                let config = canonical_config(config)?;
                let program = daemon_binary()?;
                let args: Vec<OsString> = vec![
                    "--config".into(),
                    config.into_os_string(),
                    "--socket".into(),
                    self.socket.clone().into_os_string(),
                    "--pid-file".into(),
                    self.pid_file.clone().into_os_string(),
                    "--log-dir".into(),
                    log_dir.clone().into_os_string(),
                ];

                let pid = manager.launch(&program, &args, &self.socket, DAEMON_START_TIMEOUT)?;
                output::print_success_msg(&format!("Daemon started (PID: {})", pid));
                Ok(exit_code::SUCCESS)
            }

            DaemonCommands::Stop => match self.send(Command::Shutdown) {
                Err(WardenError::DaemonNotRunning) if manager.is_running() => {
                    // the socket is gone but the process is not
                    match manager.stop_daemon(DAEMON_STOP_TIMEOUT)? {
                        StopOutcome::Graceful => output::print_success_msg("Daemon stopped"),
                        StopOutcome::Forced => output::print_info("Daemon force-stopped"),
                    }
                    Ok(exit_code::SUCCESS)
                }
                other => other,
            },

            DaemonCommands::Status => {
                let status = manager.get_status();
                match status.pid {
                    Some(pid) => match IpcClient::with_socket_path(&self.socket).ping() {
                        Ok(_) => output::print_success_msg(&format!(
                            "Daemon is running (PID: {})",
                            pid
                        )),
                        Err(e) => output::print_info(&format!(
                            "Daemon process {} is alive but not answering on {}: {}",
                            pid,
                            self.socket.display(),
                            e
                        )),
                    },
                    None => output::print_info(&format!(
                        "Daemon is not running (PID file: {})",
                        status.pid_file.display()
                    )),
                }
                Ok(exit_code::SUCCESS)
            }
        }
    }
}

/// The daemon resolves paths itself, so configs are sent absolute
fn canonical_config(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| {
        WardenError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
    })
}

fn daemon_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let candidate = exe.with_file_name(DAEMON_BINARY);
    if candidate.exists() {
        Ok(candidate)
    } else {
        // fall back to PATH lookup
        Ok(PathBuf::from(DAEMON_BINARY))
    }
}
