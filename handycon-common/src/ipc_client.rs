//! IPC client for querying the handycon daemon
//!
//! The daemon answers status queries over a Unix domain socket. Every frame is
//! a little-endian `u32` length followed by a bincode payload; one request and
//! one response per connection.

use crate::{Request, Response};
use serde::{de::DeserializeOwned, Serialize};

use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Errors that can occur during IPC communication
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Operation timeout after {0}ms")]
    OperationTimeout(u64),

    #[error("Daemon not running at {0}")]
    DaemonNotRunning(String),

    #[error("Message too large: {0} bytes exceeds maximum of {1} bytes")]
    MessageTooLarge(usize, usize),
}

/// Default socket path for the handycon daemon
pub const DEFAULT_SOCKET_PATH: &str = "/run/handycon/handycon.sock";

/// Default timeout for operations (in milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of reconnection attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay between reconnection attempts (in milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// IPC client with connection management and error handling
#[derive(Debug)]
pub struct IpcClient {
    socket_path: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcClient {
    /// Create a new IPC client with default settings
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    /// Create a new IPC client with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Set the timeout for operations
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Set reconnection parameters
    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = Duration::from_millis(retry_delay_ms);
        self
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Check if the daemon is running by attempting to connect to its socket
    pub async fn is_daemon_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Connect to the daemon, retrying up to `max_retries` times
    pub async fn connect(&self) -> Result<UnixStream, IpcError> {
        let mut attempts = 0;

        loop {
            match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    if attempts >= self.max_retries {
                        return Err(IpcError::DaemonNotRunning(self.socket_path.clone()));
                    }
                    tracing::warn!("Connection attempt {} failed: {}, retrying...", attempts + 1, e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempts += 1;
                }
                Err(_) => return Err(IpcError::ConnectionTimeout),
            }
        }
    }

    /// Send a request to the daemon and wait for its response
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let mut stream = self.connect().await?;
        self.send_with_stream(&mut stream, request).await
    }

    async fn send_with_stream(&self, stream: &mut UnixStream, request: &Request) -> Result<Response, IpcError> {
        let serialized = serialize(request)?;

        if serialized.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::MessageTooLarge(serialized.len(), MAX_MESSAGE_SIZE));
        }

        let written = timeout(self.timeout, async {
            let len = serialized.len() as u32;
            stream.write_all(&len.to_le_bytes()).await?;
            stream.write_all(&serialized).await?;
            stream.flush().await?;
            Ok::<(), io::Error>(())
        })
        .await;

        match written {
            Ok(result) => result?,
            Err(_) => return Err(IpcError::OperationTimeout(self.timeout.as_millis() as u64)),
        }

        let response = timeout(self.timeout, async {
            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let response_len = u32::from_le_bytes(len_bytes) as usize;

            if response_len > MAX_MESSAGE_SIZE {
                return Err(IpcError::MessageTooLarge(response_len, MAX_MESSAGE_SIZE));
            }

            let mut buffer = vec![0u8; response_len];
            stream.read_exact(&mut buffer).await?;

            deserialize(&buffer)
        })
        .await;

        match response {
            Ok(result) => result,
            Err(_) => Err(IpcError::OperationTimeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Send a request to the daemon using the default client
///
/// # Example
///
/// ```rust,no_run
/// use handycon_common::{ipc_client, Request};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let response = ipc_client::send(&Request::GetStatus).await?;
///     println!("Got response: {:?}", response);
///     Ok(())
/// }
/// ```
pub async fn send(request: &Request) -> Result<Response, IpcError> {
    IpcClient::new().send(request).await
}

/// Send a request to the daemon at a specific socket path
pub async fn send_to_path<P: AsRef<Path>>(request: &Request, socket_path: P) -> Result<Response, IpcError> {
    IpcClient::with_socket_path(socket_path).send(request).await
}

/// Check if the daemon is running, using DEFAULT_SOCKET_PATH when no path is given
pub async fn is_daemon_running<P: AsRef<Path>>(socket_path: Option<P>) -> bool {
    let path = socket_path
        .map(|p| p.as_ref().to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string());

    UnixStream::connect(path).await.is_ok()
}

/// Serialize a message using bincode
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    bincode::serialize(msg).map_err(|e| IpcError::Serialization(e.to_string()))
}

/// Deserialize a message using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    bincode::deserialize(bytes).map_err(|e| IpcError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProfileSummary, SourceId, SourceInfo, StatusInfo};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn sample_status() -> StatusInfo {
        StatusInfo {
            version: "0.2.0".to_string(),
            uptime_seconds: 60,
            profile: "AYA_GEN2".to_string(),
            mode: "default".to_string(),
            recognizer: "idle".to_string(),
            power_state: "awake".to_string(),
            power_degraded: false,
            events_processed: 12,
            actions_dispatched: 3,
            held_outputs: vec![],
            sources: vec![SourceInfo {
                id: SourceId::new("keyboard"),
                role: "keyboard".to_string(),
                name: "AT Translated Set 2 keyboard".to_string(),
                path: Some(PathBuf::from("/dev/input/event3")),
                connected: true,
                grabbed: true,
                last_seen_ms: Some(40),
            }],
        }
    }

    /// Mock daemon server for testing
    async fn mock_daemon(listener: UnixListener) {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut len_buf = [0u8; 4];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }

                let msg_len = u32::from_le_bytes(len_buf) as usize;
                if msg_len > MAX_MESSAGE_SIZE {
                    return;
                }

                let mut msg_buf = vec![0u8; msg_len];
                if stream.read_exact(&mut msg_buf).await.is_err() {
                    return;
                }

                let request: Request = match deserialize(&msg_buf) {
                    Ok(req) => req,
                    Err(_) => return,
                };

                let response = match request {
                    Request::GetStatus => Response::Status(sample_status()),
                    Request::ListSources => Response::Sources(sample_status().sources),
                    Request::GetProfile => Response::Profile(ProfileSummary {
                        name: "AYA_GEN2".to_string(),
                        power_mode: "native_suspend".to_string(),
                        modes: vec!["default".to_string()],
                        default_mode: "default".to_string(),
                        chords: vec![],
                    }),
                };

                let response_bytes = serialize(&response).unwrap();
                let len = response_bytes.len() as u32;
                if stream.write_all(&len.to_le_bytes()).await.is_err() {
                    return;
                }
                if stream.write_all(&response_bytes).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
            });
        }
    }

    #[tokio::test]
    async fn test_ipc_client_creation() {
        let client = IpcClient::new();
        assert_eq!(client.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(client.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(client.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(client.retry_delay, Duration::from_millis(DEFAULT_RETRY_DELAY_MS));

        let custom_client = IpcClient::with_socket_path("/tmp/test.sock")
            .with_timeout(10000)
            .with_retry_params(5, 2000);

        assert_eq!(custom_client.socket_path(), "/tmp/test.sock");
        assert_eq!(custom_client.timeout, Duration::from_millis(10000));
        assert_eq!(custom_client.max_retries, 5);
        assert_eq!(custom_client.retry_delay, Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_client_server_communication() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(mock_daemon(listener));

        let client = IpcClient::with_socket_path(&socket_path);
        assert!(client.is_daemon_running().await);

        match client.send(&Request::GetStatus).await.unwrap() {
            Response::Status(status) => {
                assert_eq!(status.profile, "AYA_GEN2");
                assert_eq!(status.uptime_seconds, 60);
                assert_eq!(status.sources.len(), 1);
            }
            other => panic!("Expected Status response, got {:?}", other),
        }

        match send_to_path(&Request::ListSources, &socket_path).await.unwrap() {
            Response::Sources(sources) => {
                assert_eq!(sources[0].id, SourceId::new("keyboard"));
                assert!(sources[0].grabbed);
            }
            other => panic!("Expected Sources response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let temp_dir = TempDir::new().unwrap();
        let client = IpcClient::with_socket_path(temp_dir.path().join("missing.sock"))
            .with_timeout(100)
            .with_retry_params(1, 10);

        match client.send(&Request::GetStatus).await {
            Err(IpcError::DaemonNotRunning(_)) | Err(IpcError::ConnectionTimeout) => {}
            other => panic!("Expected DaemonNotRunning or ConnectionTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_is_daemon_running() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!is_daemon_running(Some(temp_dir.path().join("missing.sock"))).await);
    }

    #[test]
    fn test_deserialize_garbage() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<Request, IpcError> = deserialize(&invalid_data);
        assert!(matches!(result, Err(IpcError::Serialization(_))));
    }
}
