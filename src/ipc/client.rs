// Blocking client for the daemon's control socket

use crate::error::{Result, WardenError};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Connection attempts before the daemon is reported unreachable
const CONNECT_ATTEMPTS: u32 = 3;

const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Shutdown answers only after every instance has stopped
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// One request per connection against a single daemon socket
pub struct IpcClient {
    socket_path: PathBuf,
    reply_timeout: Duration,
    next_id: AtomicU64,
}

impl IpcClient {
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            reply_timeout: REPLY_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Deliver `command` and return the daemon's reply as sent
    ///
    /// Only connecting is retried. Once the request is written the daemon
    /// may already have acted on it.
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.connect()?;
        let response = exchange(stream, &Request::new(id, command), self.reply_timeout)?;

        if response.id != id {
            return Err(WardenError::ProtocolError(format!(
                "reply {} does not answer request {}",
                response.id, id
            )));
        }
        Ok(response)
    }

    /// Like `send_command`, with a daemon-side failure turned into an error
    pub fn call(&self, command: Command) -> Result<ResponseData> {
        self.send_command(command)?.result.map_err(WardenError::from)
    }

    /// Pid of the daemon answering on the socket
    pub fn ping(&self) -> Result<u32> {
        match self.call(Command::Ping)? {
            ResponseData::Pong { pid, .. } => Ok(pid),
            other => Err(WardenError::ProtocolError(format!(
                "unexpected reply to ping: {:?}",
                other
            ))),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self) -> Result<UnixStream> {
        let mut attempt = 1;
        loop {
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    debug!(
                        "connect to {} failed (attempt {}): {}",
                        self.socket_path.display(),
                        attempt,
                        e
                    );
                    attempt += 1;
                    std::thread::sleep(CONNECT_BACKOFF);
                }
                Err(e) => return Err(connect_error(e)),
            }
        }
    }
}

/// A missing or refusing socket means no daemon; anything else is a transport fault
fn connect_error(e: std::io::Error) -> WardenError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => WardenError::DaemonNotRunning,
        _ => WardenError::ConnectionError(e.to_string()),
    }
}

/// Write one request line and read one reply line
fn exchange(mut stream: UnixStream, request: &Request, timeout: Duration) -> Result<Response> {
    let mut line = serde_json::to_string(request)
        .map_err(|e| WardenError::SerializationError(format!("request: {}", e)))?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .map_err(|e| WardenError::IpcError(format!("Failed to send request: {}", e)))?;

    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| WardenError::IpcError(format!("Failed to set read timeout: {}", e)))?;

    let mut reply = String::new();
    match BufReader::new(stream).read_line(&mut reply) {
        Ok(_) => {}
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            return Err(WardenError::TimedOut(format!(
                "no reply from daemon within {}s",
                timeout.as_secs_f64()
            )));
        }
        Err(e) => return Err(WardenError::IpcError(format!("Failed to read reply: {}", e))),
    }

    if reply.trim().is_empty() {
        return Err(WardenError::ConnectionError(
            "daemon closed the connection without replying".to_string(),
        ));
    }

    serde_json::from_str(&reply)
        .map_err(|e| WardenError::ProtocolError(format!("malformed reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code;
    use std::os::unix::net::UnixListener;
    use std::thread::JoinHandle;
    use tempfile::TempDir;

    /// Accept one connection and answer it with whatever `reply` builds from the request
    fn fake_daemon<F>(socket: &Path, reply: F) -> JoinHandle<()>
    where
        F: FnOnce(Request) -> Option<Response> + Send + 'static,
    {
        let listener = UnixListener::bind(socket).unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();

            match reply(request) {
                Some(response) => {
                    let mut stream = stream;
                    let json = serde_json::to_string(&response).unwrap();
                    writeln!(stream, "{}", json).unwrap();
                }
                // hold the connection open without answering
                None => std::thread::sleep(Duration::from_millis(500)),
            }
        })
    }

    #[test]
    fn test_ping_returns_daemon_pid() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("warden.sock");
        let daemon = fake_daemon(&socket, |request| {
            assert_eq!(request.command, Command::Ping);
            Some(Response::success(
                request.id,
                ResponseData::Pong {
                    pid: 4242,
                    uptime: Duration::from_secs(3),
                },
            ))
        });

        let client = IpcClient::with_socket_path(&socket);
        assert_eq!(client.ping().unwrap(), 4242);
        daemon.join().unwrap();
    }

    #[test]
    fn test_daemon_error_keeps_exit_code() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("warden.sock");
        let daemon = fake_daemon(&socket, |request| {
            Some(Response::error(
                request.id,
                &WardenError::ProcessNotFound("ghost".to_string()),
            ))
        });

        let client = IpcClient::with_socket_path(&socket);
        let err = client
            .call(Command::Stop {
                name: "ghost".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.exit_code(), exit_code::NO_SUCH_PROCESS);
        assert!(err.to_string().contains("ghost"));
        daemon.join().unwrap();
    }

    #[test]
    fn test_mismatched_reply_id() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("warden.sock");
        let daemon = fake_daemon(&socket, |request| {
            Some(Response::success(request.id + 100, ResponseData::ShuttingDown))
        });

        let client = IpcClient::with_socket_path(&socket);
        let result = client.send_command(Command::Status);
        assert!(matches!(result, Err(WardenError::ProtocolError(_))));
        daemon.join().unwrap();
    }

    #[test]
    fn test_silent_daemon_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("warden.sock");
        let daemon = fake_daemon(&socket, |_| None);

        let client = IpcClient::with_socket_path(&socket).with_timeout(Duration::from_millis(100));
        let result = client.send_command(Command::Status);
        assert!(matches!(result, Err(WardenError::TimedOut(_))));
        daemon.join().unwrap();
    }

    #[test]
    fn test_stale_socket_file_is_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("stale.sock");
        std::fs::write(&socket, b"").unwrap();

        let client = IpcClient::with_socket_path(&socket);
        assert!(matches!(
            client.send_command(Command::Ping),
            Err(WardenError::DaemonNotRunning) | Err(WardenError::ConnectionError(_))
        ));
    }

    #[test]
    fn test_missing_socket_is_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let client = IpcClient::with_socket_path(temp_dir.path().join("absent.sock"));
        assert!(matches!(
            client.send_command(Command::Status),
            Err(WardenError::DaemonNotRunning)
        ));
    }
}
