use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::info;

/// One (app, instance-index) slot; every handle spawned for it shares a lineage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId {
    pub app: String,
    pub instance: u32,
}

impl SlotId {
    pub fn new(app: impl Into<String>, instance: u32) -> Self {
        Self {
            app: app.into(),
            instance,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.app, self.instance)
    }
}

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Spawn issued, pid not yet confirmed live
    Starting,
    Running,
    /// Ended on its own (exit code, or the spawn itself failed)
    Exited,
    /// Ended by a signal, whoever sent it
    Killed,
    /// Waiting for a scheduled respawn
    Restarting,
    /// Permanently stopped
    Retired,
}

impl ProcessState {
    /// The pid may only be signalled in these states
    pub fn has_live_pid(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::{Exited, Killed, Restarting, Retired, Running, Starting};

        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Exited)
                | (Starting, Killed)
                | (Running, Exited)
                | (Running, Killed)
                | (Exited, Restarting)
                | (Exited, Retired)
                | (Killed, Restarting)
                | (Killed, Retired)
                | (Restarting, Starting)
                | (Restarting, Retired)
                | (Retired, Starting)
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Killed => write!(f, "killed"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::Retired => write!(f, "retired"),
        }
    }
}

/// How an OS process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }

        // neither a code nor a signal
        ExitStatus::Code(-1)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Why a handle left `Starting`/`Running`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCause {
    /// The process exited by itself
    Exited(ExitStatus),
    /// An outside signal ended the process
    Signaled(ExitStatus),
    /// Stop or restart issued by the operator
    Operator,
    /// Killed after exceeding its memory ceiling
    MemoryLimit { memory_bytes: u64, limit_bytes: u64 },
    /// Killed because a watched path changed
    FilesChanged,
    SpawnFailed(String),
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCause::Exited(status) => write!(f, "exited with {}", status),
            ExitCause::Signaled(status) => write!(f, "terminated by {}", status),
            ExitCause::Operator => write!(f, "operator request"),
            ExitCause::MemoryLimit {
                memory_bytes,
                limit_bytes,
            } => write!(
                f,
                "memory limit exceeded ({} > {} bytes)",
                memory_bytes, limit_bytes
            ),
            ExitCause::FilesChanged => write!(f, "watched files changed"),
            ExitCause::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
        }
    }
}

/// A point-in-time resource reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub memory_bytes: u64,
    /// Share of one CPU core, 1.0 = one core fully busy
    pub cpu_fraction: f32,
}

/// Runtime record of the process currently filling a slot
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub slot: SlotId,
    /// Bumped on every spawn so events from a previous OS process can be discarded
    pub generation: u64,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub running_since: Option<Instant>,
    pub restart_count: u32,
    pub last_exit: Option<ExitStatus>,
    pub last_cause: Option<ExitCause>,
    pub usage: UsageSample,
    /// Set when automatic recovery was given up
    pub alarm: Option<String>,
}

impl ProcessHandle {
    /// A fresh lineage, created in `Starting` for its first spawn
    pub fn new(slot: SlotId) -> Self {
        Self {
            slot,
            generation: 0,
            state: ProcessState::Starting,
            pid: None,
            started_at: None,
            running_since: None,
            restart_count: 0,
            last_exit: None,
            last_cause: None,
            usage: UsageSample::default(),
            alarm: None,
        }
    }

    /// The pid, but only while it is still safe to signal
    pub fn signalable_pid(&self) -> Option<u32> {
        if self.state.has_live_pid() {
            self.pid
        } else {
            None
        }
    }

    /// Move to `next`, logging the cause; the only place a handle changes state
    pub fn transition(&mut self, next: ProcessState, cause: &str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WardenError::Other(format!(
                "invalid transition for {}: {} -> {}",
                self.slot, self.state, next
            )));
        }

        info!(
            slot = %self.slot,
            generation = self.generation,
            from = %self.state,
            to = %next,
            cause = cause,
            "state transition"
        );

        match next {
            ProcessState::Starting => {
                self.generation += 1;
                self.pid = None;
                self.started_at = None;
                self.running_since = None;
                self.usage = UsageSample::default();
            }
            ProcessState::Running => {
                self.running_since = Some(Instant::now());
            }
            ProcessState::Exited
            | ProcessState::Killed
            | ProcessState::Restarting
            | ProcessState::Retired => {
                self.pid = None;
                self.running_since = None;
            }
        }

        self.state = next;
        Ok(())
    }

    /// How long the current process has been confirmed running
    pub fn uptime(&self) -> Option<Duration> {
        self.running_since.map(|since| since.elapsed())
    }

    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            app: self.slot.app.clone(),
            instance: self.slot.instance,
            state: self.state,
            pid: self.signalable_pid(),
            uptime: self.uptime(),
            restart_count: self.restart_count,
            last_exit: self.last_exit,
            last_cause: self.last_cause.as_ref().map(|c| c.to_string()),
            memory_bytes: self.usage.memory_bytes,
            cpu_fraction: self.usage.cpu_fraction,
            alarm: self.alarm.clone(),
        }
    }
}

/// Snapshot of one handle as reported by `status()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleSummary {
    pub app: String,
    pub instance: u32,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub restart_count: u32,
    pub last_exit: Option<ExitStatus>,
    pub last_cause: Option<String>,
    pub memory_bytes: u64,
    pub cpu_fraction: f32,
    pub alarm: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use ProcessState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Killed));
        assert!(Exited.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Retired));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Retired.can_transition_to(Running));
        assert!(!Restarting.can_transition_to(Running));
    }

    #[test]
    fn test_pid_invalid_after_exit() {
        let mut handle = ProcessHandle::new(SlotId::new("api", 0));
        handle.pid = Some(4242);
        assert_eq!(handle.signalable_pid(), Some(4242));

        handle.transition(ProcessState::Running, "confirmed").unwrap();
        assert_eq!(handle.signalable_pid(), Some(4242));
        assert!(handle.uptime().is_some());

        handle.transition(ProcessState::Exited, "exit code 1").unwrap();
        assert_eq!(handle.signalable_pid(), None);
        assert_eq!(handle.pid, None);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut handle = ProcessHandle::new(SlotId::new("api", 0));
        assert!(handle.transition(ProcessState::Retired, "nope").is_err());
        assert_eq!(handle.state, ProcessState::Starting);
    }

    #[test]
    fn test_starting_bumps_generation() {
        let mut handle = ProcessHandle::new(SlotId::new("api", 0));
        handle.transition(ProcessState::Exited, "spawn failed").unwrap();
        handle.transition(ProcessState::Restarting, "backoff").unwrap();
        handle.transition(ProcessState::Starting, "respawn").unwrap();
        assert_eq!(handle.generation, 1);
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(SlotId::new("fileship-srv", 0).to_string(), "fileship-srv:0");
    }

    #[test]
    fn test_exit_status_clean() {
        assert!(ExitStatus::Code(0).is_clean());
        assert!(!ExitStatus::Code(1).is_clean());
        assert!(!ExitStatus::Signal(9).is_clean());
    }

    #[test]
    fn test_summary_hides_stale_pid() {
        let mut handle = ProcessHandle::new(SlotId::new("api", 1));
        handle.pid = Some(7);
        handle.transition(ProcessState::Killed, "signal 9").unwrap();
        let summary = handle.summary();
        assert_eq!(summary.pid, None);
        assert_eq!(summary.instance, 1);
        assert_eq!(summary.state, ProcessState::Killed);
    }
}
