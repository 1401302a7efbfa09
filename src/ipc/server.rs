// IPC Server - Listens for client connections and handles requests

use crate::error::{Result, WardenError};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Default socket path for daemon communication
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/warden.sock";

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    /// Signalled once a shutdown response has been delivered
    stopped: Arc<Notify>,
}

impl IpcServer {
    /// Create a new IPC server with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    /// Create a new IPC server with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
            stopped: Arc::new(Notify::new()),
        }
    }

    /// Bind the Unix socket; must be called from within the runtime
    pub fn start(&mut self) -> Result<()> {
        // Remove existing socket file if it exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                WardenError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| WardenError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        // Socket is accessible only by its owner (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                WardenError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        info!("IPC server listening on {}", self.socket_path.display());
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections until a shutdown command has been answered
    ///
    /// Every connection carries one request and is served on its own task.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| WardenError::IpcError("Server not started".to_string()))?;
        let handler = Arc::new(handler);

        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = self.stopped.notified() => {
                    info!("IPC server stopping after shutdown request");
                    return Ok(());
                }
            };

            let handler = Arc::clone(&handler);
            let stopped = Arc::clone(&self.stopped);

            tokio::spawn(async move {
                if let Err(e) = Self::serve(stream, handler.as_ref(), &stopped).await {
                    warn!("IPC connection failed: {}", e);
                }
            });
        }
    }

    async fn serve<F, Fut>(stream: UnixStream, handler: &F, stopped: &Notify) -> Result<()>
    where
        F: Fn(Command) -> Fut,
        Fut: Future<Output = Result<ResponseData>>,
    {
        let (read_half, mut write_half) = stream.into_split();

        let mut reader = BufReader::new(read_half);
        let mut request_line = String::new();
        reader
            .read_line(&mut request_line)
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to read request: {}", e)))?;

        let request: Request = serde_json::from_str(&request_line).map_err(|e| {
            WardenError::ProtocolError(format!("Failed to deserialize request: {}", e))
        })?;
        debug!("IPC request {}: {:?}", request.id, request.command);

        let response = match handler(request.command).await {
            Ok(data) => Response::success(request.id, data),
            Err(e) => Response::error(request.id, &e),
        };

        let mut response_json = serde_json::to_string(&response).map_err(|e| {
            WardenError::SerializationError(format!("Failed to serialize response: {}", e))
        })?;
        response_json.push('\n');

        write_half
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to write response: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to flush stream: {}", e)))?;

        if response.is_shutdown() {
            stopped.notify_one();
        }

        Ok(())
    }

    /// Stop the server and clean up the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                WardenError::IpcError(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        // Clean up socket file on drop
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_server_creation() {
        let server = IpcServer::new();
        assert_eq!(server.socket_path(), Path::new(DEFAULT_SOCKET_PATH));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        let mut server = IpcServer::with_socket_path(&socket_path);

        assert!(server.start().is_ok());
        assert!(socket_path.exists());

        assert!(server.stop().is_ok());
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_cleanup_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        {
            let mut server = IpcServer::with_socket_path(&socket_path);
            server.start().unwrap();
            assert!(socket_path.exists());
        }
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_run_requires_start() {
        let server = IpcServer::with_socket_path("/tmp/warden-never-bound.sock");
        let result = server.run(|_| async { Ok(ResponseData::ShuttingDown) }).await;
        assert!(matches!(result, Err(WardenError::IpcError(_))));
    }
}
