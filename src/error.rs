use thiserror::Error;

/// Exit codes reported by the command-line front-end
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION: i32 = 1;
    pub const NO_SUCH_PROCESS: i32 = 2;
    pub const PARTIAL_FAILURE: i32 = 3;
}

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Unknown configuration key '{key}' in app '{app}'")]
    UnknownConfigKey { app: String, key: String },

    // Process-related errors
    #[error("No such process: {0}")]
    ProcessNotFound(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("Resource usage unavailable for pid {0}")]
    UsageUnavailable(u32),

    #[error("Restart limit exceeded for {0}")]
    Escalated(String),

    #[error("Operation timed out: {0}")]
    TimedOut(String),

    /// A command the daemon refused, with the exit code it chose
    #[error("{message}")]
    Rejected { message: String, exit_code: i32 },

    // Supervisor and IPC errors
    #[error("Supervisor is not running")]
    SupervisorGone,

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running (pid {0})")]
    DaemonAlreadyRunning(u32),

    // Log capture errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Log rotation failed: {0}")]
    LogRotationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("{0}")]
    Other(String),
}

impl WardenError {
    /// Map the error to the exit code the CLI reports for it
    pub fn exit_code(&self) -> i32 {
        match self {
            WardenError::ConfigError(_)
            | WardenError::InvalidConfig(_)
            | WardenError::MissingConfigField(_)
            | WardenError::UnknownConfigKey { .. } => exit_code::VALIDATION,
            WardenError::ProcessNotFound(_) => exit_code::NO_SUCH_PROCESS,
            WardenError::Rejected { exit_code, .. } => *exit_code,
            _ => exit_code::VALIDATION,
        }
    }

    /// Whether this error rejects a configuration entry rather than an operation
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            WardenError::ConfigError(_)
                | WardenError::InvalidConfig(_)
                | WardenError::MissingConfigField(_)
                | WardenError::UnknownConfigKey { .. }
        )
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            WardenError::ConfigError("bad".to_string()).exit_code(),
            exit_code::VALIDATION
        );
        assert_eq!(
            WardenError::ProcessNotFound("api".to_string()).exit_code(),
            exit_code::NO_SUCH_PROCESS
        );
        assert_eq!(
            WardenError::Rejected {
                message: "1 of 2 instances failed".to_string(),
                exit_code: exit_code::PARTIAL_FAILURE,
            }
            .exit_code(),
            exit_code::PARTIAL_FAILURE
        );
    }

    #[test]
    fn test_unknown_key_message() {
        let err = WardenError::UnknownConfigKey {
            app: "fileship-srv".to_string(),
            key: "max_memroy_restart".to_string(),
        };
        assert!(err.to_string().contains("max_memroy_restart"));
        assert!(err.is_config_error());
    }
}
