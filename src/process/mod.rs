// Process module - Handles, spawning, monitoring and the supervisor loop

pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
mod types;
pub mod watch;

pub use monitor::{MonitorEvent, MonitorSnapshot, ResourceMonitor, SysinfoSource, UsageSource};
pub use restart::{RestartAction, RestartCause, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{resolve_program, send_signal, spawn_instance, SpawnedProcess};
pub use supervisor::{CommandOutcome, ReloadOutcome, SupervisorHandle};
pub use types::{
    ExitCause, ExitStatus, HandleSummary, ProcessHandle, ProcessState, SlotId, UsageSample,
};
