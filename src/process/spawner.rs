use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::logs::capture_output;
use crate::process::SlotId;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::warn;

/// Environment variable carrying the app name into every child
pub const APP_NAME_ENV: &str = "WARDEN_APP_NAME";

/// Environment variable carrying the instance index into every child
pub const INSTANCE_ENV: &str = "WARDEN_INSTANCE";

/// A freshly spawned OS process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,

    /// Tasks copying stdout/stderr into the log directory
    pub capture: Vec<JoinHandle<()>>,
}

/// Spawn one instance of `spec`
///
/// Applies the working directory, the configured environment on top of the
/// inherited one, and attaches output capture under `log_dir`. The file system
/// checks and the fork/exec run on the blocking pool.
///
/// # Arguments
/// * `spec` - Validated application spec
/// * `instance` - Instance index within the app
/// * `log_dir` - Directory receiving the captured output
/// * `timeout` - How long the spawn may take
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Process is running and its output is captured
/// * `Err(WardenError::SpawnError)` - The program could not be started
/// * `Err(WardenError::TimedOut)` - The spawn did not finish within `timeout`
pub async fn spawn_instance(
    spec: &ProcessSpec,
    instance: u32,
    log_dir: &Path,
    timeout: Duration,
) -> Result<SpawnedProcess> {
    let owned = spec.clone();
    let log_dir = log_dir.to_path_buf();
    with_deadline(&spec.name, timeout, move || {
        start_process(&owned, instance, &log_dir)
    })
    .await
}

/// Run `spawn` on the blocking pool, giving up on it after `timeout`
///
/// A process that still comes up after the deadline is killed and reaped.
async fn with_deadline<F>(name: &str, timeout: Duration, spawn: F) -> Result<SpawnedProcess>
where
    F: FnOnce() -> Result<SpawnedProcess> + Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(spawn);

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(WardenError::SpawnError(format!(
            "spawn of '{}' did not complete: {}",
            name, e
        ))),
        Err(_) => {
            let name = name.to_string();
            let message = format!("spawn of '{}' after {}ms", name, timeout.as_millis());
            tokio::spawn(async move {
                if let Ok(Ok(mut late)) = task.await {
                    warn!(pid = late.pid, "killing '{}', spawned after its deadline", name);
                    if let Err(e) = late.child.kill().await {
                        warn!("Failed to kill late spawn of '{}': {}", name, e);
                    }
                }
            });
            Err(WardenError::TimedOut(message))
        }
    }
}

fn start_process(spec: &ProcessSpec, instance: u32, log_dir: &Path) -> Result<SpawnedProcess> {
    if !spec.cwd.is_dir() {
        return Err(WardenError::SpawnError(format!(
            "Working directory does not exist: {}",
            spec.cwd.display()
        )));
    }

    let (program, args) = spec.command_line();
    let program = resolve_program(&program, &spec.cwd)?;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .env(APP_NAME_ENV, &spec.name)
        .env(INSTANCE_ENV, instance.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| {
        WardenError::SpawnError(format!(
            "Failed to spawn '{}' ({}): {}",
            spec.name,
            program.display(),
            e
        ))
    })?;

    let pid = child.id().ok_or_else(|| {
        WardenError::SpawnError(format!("Failed to get PID for process '{}'", spec.name))
    })?;

    let capture = capture_output(&mut child, &SlotId::new(spec.name.clone(), instance), log_dir);

    Ok(SpawnedProcess {
        child,
        pid,
        capture,
    })
}

/// Locate the executable for `program`
///
/// A name containing a path separator is taken relative to `cwd`; a bare
/// name is searched on `PATH`.
pub fn resolve_program(program: &str, cwd: &Path) -> Result<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let candidate = cwd.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        return Err(WardenError::SpawnError(format!(
            "Program is not an executable file: {}",
            candidate.display()
        )));
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| WardenError::SpawnError(format!("Program not found on PATH: {}", program)))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}

/// Send `sig` to `pid`
pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| WardenError::SignalError(format!("Invalid PID: {}", pid)))?;

    signal::kill(Pid::from_raw(raw), sig)
        .map_err(|e| WardenError::SignalError(format!("Failed to send {} to {}: {}", sig, pid, e)))
}
