// Daemon core: hosts the supervisor loop behind the IPC server

use crate::config::{EcosystemFile, SpecStore};
use crate::error::{Result, WardenError};
use crate::ipc::{Command, IpcServer, ResponseData};
use crate::process::{SupervisorHandle, SysinfoSource};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Default directory for captured process output
pub const DEFAULT_LOG_DIR: &str = "/tmp/warden_logs";

/// Where the daemon reads its configuration and exposes its socket
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
}

/// A running supervisor plus the IPC server that fronts it
pub struct Daemon {
    supervisor: SupervisorHandle,
    supervisor_task: JoinHandle<()>,
    ipc_server: IpcServer,
    start_time: Instant,
}

impl Daemon {
    /// Load the ecosystem file, start every valid app and bind the socket
    ///
    /// Entries that fail validation are logged and skipped; a file that
    /// cannot be read at all is an error.
    pub async fn start(options: &DaemonOptions) -> Result<Self> {
        let file = EcosystemFile::from_file(&options.config_path)?;
        let settings = file.supervisor.clone();
        settings.validate()?;

        let (store, rejected) = SpecStore::load(&file)?;
        for entry in &rejected {
            error!("Skipping app {}: {}", entry.label, entry.error);
        }
        info!(
            "Loaded {} app(s) from {}",
            store.len(),
            options.config_path.display()
        );

        std::fs::create_dir_all(&options.log_dir)?;

        let mut ipc_server = IpcServer::with_socket_path(&options.socket_path);
        ipc_server.start()?;

        let (supervisor, supervisor_task) = SupervisorHandle::spawn(
            store,
            settings,
            options.log_dir.clone(),
            SysinfoSource::new(),
        );

        Ok(Self {
            supervisor,
            supervisor_task,
            ipc_server,
            start_time: Instant::now(),
        })
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn socket_path(&self) -> &Path {
        self.ipc_server.socket_path()
    }

    /// Serve clients until a shutdown command or SIGTERM/SIGINT arrives
    pub async fn run(self) -> Result<()> {
        let Daemon {
            supervisor,
            supervisor_task,
            mut ipc_server,
            start_time,
        } = self;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let handler_supervisor = supervisor.clone();
        let served = ipc_server.run(move |command| {
            let supervisor = handler_supervisor.clone();
            async move { Self::handle_command(&supervisor, command, start_time).await }
        });

        tokio::select! {
            result = served => {
                // a shutdown command already stopped every instance
                result?;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                Self::stop_supervisor(&supervisor).await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                Self::stop_supervisor(&supervisor).await;
            }
        }

        if let Err(e) = supervisor_task.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }
        ipc_server.stop()?;

        info!("Daemon shutdown complete");
        Ok(())
    }

    async fn stop_supervisor(supervisor: &SupervisorHandle) {
        info!("Shutting down daemon gracefully...");
        match supervisor.shutdown().await {
            Ok(()) | Err(WardenError::SupervisorGone) => {}
            Err(e) => error!("Error during graceful shutdown: {}", e),
        }
    }

    /// Map one IPC command onto the supervisor
    pub async fn handle_command(
        supervisor: &SupervisorHandle,
        command: Command,
        start_time: Instant,
    ) -> Result<ResponseData> {
        match command {
            Command::Start { name } => supervisor.start(&name).await.map(ResponseData::Outcome),
            Command::Stop { name } => supervisor.stop(&name).await.map(ResponseData::Outcome),
            Command::Restart { name } => {
                supervisor.restart(&name).await.map(ResponseData::Outcome)
            }
            Command::Reload { config } => {
                let file = EcosystemFile::from_file(&config)?;
                supervisor.reload(file).await.map(ResponseData::Reloaded)
            }
            Command::Status => supervisor.status().await.map(ResponseData::Status),
            Command::Shutdown => {
                Self::stop_supervisor(supervisor).await;
                Ok(ResponseData::ShuttingDown)
            }
            Command::Ping => Ok(ResponseData::Pong {
                pid: std::process::id(),
                uptime: start_time.elapsed(),
            }),
        }
    }
}
