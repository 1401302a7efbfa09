// Logs module - Capture of child stdout/stderr into rotated files

mod capture;
mod writer;

pub use capture::capture_output;
pub use writer::{log_path, LogStream, LogWriter, DEFAULT_MAX_LOG_SIZE};
