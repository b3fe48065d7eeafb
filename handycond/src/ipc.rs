use handycon_common::ipc_client::MAX_MESSAGE_SIZE;
use handycon_common::{tracing, deserialize, serialize, ProfileSummary, Request, Response, StatusInfo};
use nix::unistd::{chown, Group};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::DaemonError;

type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// What the server answers from
struct Snapshot {
    status: watch::Receiver<StatusInfo>,
    profile: ProfileSummary,
    started: Instant,
}

/// Read-only status server for `handycon` clients
pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Create a new IPC server, removing a stale socket left at `socket_path`
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Result<Self, DaemonError> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self {
            socket_path,
            shutdown_tx: None,
            task: None,
        })
    }

    /// Bind the socket and serve status requests until shutdown
    pub fn start(
        &mut self,
        status: watch::Receiver<StatusInfo>,
        profile: ProfileSummary,
        socket_group: &str,
    ) -> Result<(), DaemonError> {
        info!("Starting IPC server at {}", self.socket_path.display());

        let listener = UnixListener::bind(&self.socket_path)?;
        if let Err(e) = set_socket_permissions(&self.socket_path, socket_group) {
            // Root can still query the daemon
            warn!("Failed to set socket permissions: {}", e);
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let snapshot = Arc::new(Snapshot {
            status,
            profile,
            started: Instant::now(),
        });

        self.task = Some(task::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => match connection {
                        Ok((stream, _)) => {
                            debug!("New client connected");
                            let snapshot = Arc::clone(&snapshot);
                            task::spawn(async move {
                                if let Err(e) = handle_client(stream, &snapshot).await {
                                    error!("Error handling client: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Error accepting connection: {}", e),
                    },
                    _ = &mut shutdown_rx => {
                        debug!("IPC accept loop stopped");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop accepting clients and remove the socket
    pub async fn shutdown(&mut self) -> Result<(), DaemonError> {
        info!("Shutting down IPC server");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("IPC server task failed: {}", e);
            }
        }
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }

        Ok(())
    }
}

/// Socket mode 0660, owned by `group` so members can query without root
pub fn set_socket_permissions(socket_path: &Path, group: &str) -> Result<(), ClientError> {
    let mut perms = fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(socket_path, perms)?;

    if group.is_empty() {
        return Ok(());
    }
    let group = Group::from_name(group)?.ok_or_else(|| format!("group '{}' not found", group))?;
    chown(socket_path, None, Some(group.gid))?;

    debug!("Socket {} set to mode 0660, group {}", socket_path.display(), group.name);
    Ok(())
}

async fn handle_client(mut stream: UnixStream, snapshot: &Snapshot) -> Result<(), ClientError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_SIZE {
        warn!("Received oversized message: {} bytes", msg_len);
        return Err("message too large".into());
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;

    let response = match deserialize::<Request>(&msg_buf) {
        Ok(request) => {
            debug!("Received request: {:?}", request);
            handle_request(request, snapshot)
        }
        Err(e) => Response::Error(format!("malformed request: {}", e)),
    };

    let response_bytes = serialize(&response);
    let len = response_bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&response_bytes).await?;
    stream.flush().await?;

    Ok(())
}

fn handle_request(request: Request, snapshot: &Snapshot) -> Response {
    match request {
        Request::GetStatus => {
            let mut status = snapshot.status.borrow().clone();
            status.uptime_seconds = snapshot.started.elapsed().as_secs();
            Response::Status(status)
        }
        Request::ListSources => Response::Sources(snapshot.status.borrow().sources.clone()),
        Request::GetProfile => Response::Profile(snapshot.profile.clone()),
    }
}
