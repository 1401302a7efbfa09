use crate::logs::writer::{LogStream, LogWriter};
use crate::process::SlotId;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::warn;

/// Take the child's stdout/stderr pipes and copy them into the slot's log files.
///
/// The pipes are owned by the returned tasks, which end (releasing the
/// descriptors) once the process closes its side.
pub fn capture_output(child: &mut Child, slot: &SlotId, log_dir: &Path) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(2);

    if let Some(stdout) = child.stdout.take() {
        tasks.push(tokio::spawn(pump(
            stdout,
            slot.clone(),
            log_dir.to_path_buf(),
            LogStream::Stdout,
        )));
    }

    if let Some(stderr) = child.stderr.take() {
        tasks.push(tokio::spawn(pump(
            stderr,
            slot.clone(),
            log_dir.to_path_buf(),
            LogStream::Stderr,
        )));
    }

    tasks
}

async fn pump<R>(pipe: R, slot: SlotId, log_dir: std::path::PathBuf, stream: LogStream)
where
    R: AsyncRead + Unpin,
{
    let mut writer = match LogWriter::open(&log_dir, &slot, stream).await {
        Ok(writer) => writer,
        Err(e) => {
            warn!("Output of {} will not be captured: {}", slot, e);
            return;
        }
    };

    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Err(e) = writer.write_line(&line).await {
                    warn!("Failed to write output of {}: {}", slot, e);
                }
            }
            Err(_) => break,
        }
    }

    let _ = writer.flush().await;
}
