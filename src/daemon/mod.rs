// Daemon module - Background process management

pub mod manager;
pub mod pid;
pub mod runtime;

pub use manager::{DaemonManager, DaemonStatus, StopOutcome};
pub use pid::{PidFile, DEFAULT_PID_FILE};
pub use runtime::{Daemon, DaemonOptions, DEFAULT_LOG_DIR};
