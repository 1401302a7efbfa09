// PID file management for daemon process

use crate::error::{Result, WardenError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

/// Default PID file location
pub const DEFAULT_PID_FILE: &str = "/tmp/warden.pid";

/// Manages the daemon PID file
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create a new PID file manager with default path
    pub fn new() -> Self {
        Self::with_path(DEFAULT_PID_FILE)
    }

    /// Create a new PID file manager with custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Write the current process PID to the file
    pub fn write(&self) -> Result<()> {
        let pid = std::process::id();
        fs::write(&self.path, format!("{}\n", pid)).map_err(|e| {
            WardenError::Other(format!(
                "Failed to write PID file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Read the PID from the file
    pub fn read(&self) -> Result<u32> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            WardenError::Other(format!(
                "Failed to read PID file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        content
            .trim()
            .parse::<u32>()
            .map_err(|e| WardenError::Other(format!("Invalid PID in file: {}", e)))
    }

    /// Check if the PID file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Remove the PID file
    pub fn remove(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// True when the file names a process that is still alive
    pub fn is_daemon_running(&self) -> bool {
        match self.read() {
            Ok(pid) => is_process_alive(pid),
            Err(_) => false,
        }
    }

    /// Get the path to the PID file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for PidFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe a pid with the null signal
pub(crate) fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        // exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
