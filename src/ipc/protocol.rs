// IPC Protocol definitions for client-daemon communication

use crate::error::{exit_code, WardenError};
use crate::process::{CommandOutcome, HandleSummary, ReloadOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    /// Re-read an ecosystem file; the path must be absolute
    Reload { config: PathBuf },
    Status,
    /// Stop every instance, then end the daemon
    Shutdown,
    Ping,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Per-instance result of start/stop/restart
    Outcome(CommandOutcome),
    Reloaded(ReloadOutcome),
    Status(Vec<HandleSummary>),
    Pong { pid: u32, uptime: Duration },
    /// Every instance is stopped and the daemon is exiting
    ShuttingDown,
}

impl ResponseData {
    pub fn exit_code(&self) -> i32 {
        match self {
            ResponseData::Outcome(outcome) => outcome.exit_code(),
            ResponseData::Reloaded(outcome) => outcome.exit_code(),
            _ => exit_code::SUCCESS,
        }
    }
}

/// A failed command, carrying the exit code the CLI should report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
    pub exit_code: i32,
}

impl From<&WardenError> for ErrorReply {
    fn from(error: &WardenError) -> Self {
        Self {
            message: error.to_string(),
            exit_code: error.exit_code(),
        }
    }
}

impl From<ErrorReply> for WardenError {
    fn from(reply: ErrorReply) -> Self {
        WardenError::Rejected {
            message: reply.message,
            exit_code: reply.exit_code,
        }
    }
}

/// Request message from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, ErrorReply>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: &WardenError) -> Self {
        Self {
            id,
            result: Err(error.into()),
        }
    }

    /// Exit code the CLI should terminate with for this response
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(data) => data.exit_code(),
            Err(error) => error.exit_code,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self.result, Ok(ResponseData::ShuttingDown))
    }
}
