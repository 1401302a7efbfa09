// Daemon lifecycle management

use super::pid::{is_process_alive, PidFile};
use crate::error::{Result, WardenError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    /// Still alive after the timeout and killed
    Forced,
}

/// Daemon manager for controlling daemon lifecycle
pub struct DaemonManager {
    pid_file: PidFile,
}

impl DaemonManager {
    /// Create a new daemon manager with default PID file
    pub fn new() -> Self {
        Self {
            pid_file: PidFile::new(),
        }
    }

    /// Create a new daemon manager with custom PID file path
    pub fn with_pid_file(pid_file: PidFile) -> Self {
        Self { pid_file }
    }

    /// Check if the daemon is currently running
    pub fn is_running(&self) -> bool {
        self.pid_file.is_daemon_running()
    }

    /// Get the PID of the running daemon, if any
    pub fn get_pid(&self) -> Option<u32> {
        self.pid_file.read().ok().filter(|&pid| is_process_alive(pid))
    }

    /// Record the current process as the daemon (called from within the daemon process)
    pub fn register_daemon(&self) -> Result<()> {
        if let Some(pid) = self.get_pid() {
            if pid != std::process::id() {
                return Err(WardenError::DaemonAlreadyRunning(pid));
            }
        }

        // stale file from a daemon that died without cleaning up
        self.pid_file.remove()?;
        self.pid_file.write()
    }

    /// Unregister the daemon (called during daemon shutdown)
    pub fn unregister_daemon(&self) -> Result<()> {
        self.pid_file.remove()
    }

    /// Start `program` detached in the background and wait until `socket_path` appears
    pub fn launch(
        &self,
        program: &Path,
        args: &[OsString],
        socket_path: &Path,
        timeout: Duration,
    ) -> Result<u32> {
        if let Some(pid) = self.get_pid() {
            return Err(WardenError::DaemonAlreadyRunning(pid));
        }

        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                WardenError::SpawnError(format!("{}: {}", program.display(), e))
            })?;

        let started = Instant::now();
        while started.elapsed() < timeout {
            if socket_path.exists() {
                return Ok(child.id());
            }
            if let Some(status) = child.try_wait()? {
                return Err(WardenError::SpawnError(format!(
                    "daemon exited during startup ({})",
                    status
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        Err(WardenError::TimedOut(format!(
            "daemon socket {} did not appear",
            socket_path.display()
        )))
    }

    /// SIGTERM the daemon, escalating to SIGKILL after `timeout`
    pub fn stop_daemon(&self, timeout: Duration) -> Result<StopOutcome> {
        let pid = self.get_pid().ok_or(WardenError::DaemonNotRunning)?;
        let target = Pid::from_raw(
            i32::try_from(pid).map_err(|_| WardenError::Other(format!("Invalid PID {}", pid)))?,
        );

        kill(target, Signal::SIGTERM)
            .map_err(|e| WardenError::SignalError(format!("SIGTERM to {}: {}", pid, e)))?;

        if self.wait_for_exit(pid, timeout) {
            self.pid_file.remove()?;
            return Ok(StopOutcome::Graceful);
        }

        kill(target, Signal::SIGKILL)
            .map_err(|e| WardenError::SignalError(format!("SIGKILL to {}: {}", pid, e)))?;

        if self.wait_for_exit(pid, Duration::from_secs(1)) {
            self.pid_file.remove()?;
            return Ok(StopOutcome::Forced);
        }

        Err(WardenError::Other(
            "Failed to stop daemon even with SIGKILL".to_string(),
        ))
    }

    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if !is_process_alive(pid) {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        !is_process_alive(pid)
    }

    /// Get daemon status information
    pub fn get_status(&self) -> DaemonStatus {
        let pid = self.get_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.path().to_path_buf(),
        }
    }
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Daemon status information
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
}
