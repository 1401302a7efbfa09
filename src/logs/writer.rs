use crate::error::{Result, WardenError};
use crate::process::SlotId;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Default maximum log file size before rotation (10MB)
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Which pipe of the child a writer records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn suffix(&self) -> &'static str {
        match self {
            LogStream::Stdout => "out",
            LogStream::Stderr => "err",
        }
    }
}

/// Path of the live log file for one slot and stream
pub fn log_path(log_dir: &Path, slot: &SlotId, stream: LogStream) -> PathBuf {
    log_dir.join(format!(
        "{}-{}-{}.log",
        slot.app,
        slot.instance,
        stream.suffix()
    ))
}

/// Appends timestamped lines of one stream to a size-rotated file
pub struct LogWriter {
    path: PathBuf,
    file: File,
    max_size: u64,
    size: u64,
}

impl LogWriter {
    pub async fn open(log_dir: &Path, slot: &SlotId, stream: LogStream) -> Result<Self> {
        Self::with_max_size(log_dir, slot, stream, DEFAULT_MAX_LOG_SIZE).await
    }

    pub async fn with_max_size(
        log_dir: &Path,
        slot: &SlotId,
        stream: LogStream,
        max_size: u64,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to create log directory: {}", e)))?;

        let path = log_path(log_dir, slot, stream);
        let file = Self::open_append(&path).await?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            file,
            max_size,
            size,
        })
    }

    async fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to open {}: {}", path.display(), e)))
    }

    /// Write one line, rotating first if the file is full
    pub async fn write_line(&mut self, data: &[u8]) -> Result<()> {
        if self.size >= self.max_size {
            self.rotate().await?;
        }

        let entry = format_entry(&Local::now(), data);

        self.file
            .write_all(&entry)
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to write to log: {}", e)))?;

        self.size += entry.len() as u64;
        Ok(())
    }

    /// Rename the current file with a timestamp suffix and start a new one
    async fn rotate(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| WardenError::LogRotationError(e.to_string()))?;

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| WardenError::LogRotationError("Invalid log file name".to_string()))?;
        let timestamp = Local::now().format("%Y%m%d-%H%M%S%.3f");
        let rotated = self.path.with_file_name(format!("{}-{}.log", stem, timestamp));

        tokio::fs::rename(&self.path, &rotated)
            .await
            .map_err(|e| WardenError::LogRotationError(format!("Failed to rotate log: {}", e)))?;

        self.file = Self::open_append(&self.path).await?;
        self.size = 0;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to flush log: {}", e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

// Format: [YYYY-MM-DD HH:MM:SS.mmm] <data>\n
fn format_entry(timestamp: &DateTime<Local>, data: &[u8]) -> Vec<u8> {
    let stamp = timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    let mut entry = Vec::with_capacity(stamp.len() + 4 + data.len());
    entry.push(b'[');
    entry.extend_from_slice(stamp.as_bytes());
    entry.extend_from_slice(b"] ");
    entry.extend_from_slice(data);
    if !data.ends_with(b"\n") {
        entry.push(b'\n');
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writer_paths() {
        let temp_dir = TempDir::new().unwrap();
        let slot = SlotId::new("api", 2);

        let writer = LogWriter::open(temp_dir.path(), &slot, LogStream::Stderr)
            .await
            .unwrap();
        assert!(writer.path().ends_with("api-2-err.log"));
        assert!(writer.path().exists());
    }

    #[tokio::test]
    async fn test_timestamped_lines() {
        let temp_dir = TempDir::new().unwrap();
        let slot = SlotId::new("api", 0);

        let mut writer = LogWriter::open(temp_dir.path(), &slot, LogStream::Stdout)
            .await
            .unwrap();
        writer.write_line(b"first").await.unwrap();
        writer.write_line(b"second\n").await.unwrap();
        writer.flush().await.unwrap();

        let content = tokio::fs::read_to_string(writer.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[tokio::test]
    async fn test_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let slot = SlotId::new("chatty", 0);

        let mut writer =
            LogWriter::with_max_size(temp_dir.path(), &slot, LogStream::Stdout, 64)
                .await
                .unwrap();
        for _ in 0..10 {
            writer.write_line(b"a line that fills the log").await.unwrap();
        }
        writer.flush().await.unwrap();

        let files = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert!(files >= 2, "expected rotated files, found {}", files);
        assert!(writer.size() <= 64 + 64);
    }
}
