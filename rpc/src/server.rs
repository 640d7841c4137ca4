//! The adapter server.
//!
//! Holds non-owning mounts onto VMs and serves their exports over TCP.
//! The accept loop spawns one task per connection; within a connection,
//! requests are *enqueued on the target VM in arrival order* by the read
//! loop, then answered out of order as calls complete. Serialization is
//! the VM's job, not the adapter's.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use hindsight_types::Value;
use hindsight_vm::{CallInvocation, Mounter, Vm, VmError};

use crate::proto::{
    read_frame_bytes, write_frame, Request, Response, ERR_CAPACITY, ERR_CLOSED, ERR_GUEST,
    ERR_INTERNAL, ERR_MALFORMED_REQUEST, ERR_METHOD_NOT_SUPPORTED, ERR_UNKNOWN_MOUNT,
};
use crate::RpcError;

/// Method names never exposed over a mount.
const BLACKLIST: &[&str] = &["init"];

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Listen port; 0 lets the OS pick (see [`RpcServer::local_addr`]).
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { port: 5555 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Created,
    Running,
    Stopped,
}

struct Mount {
    vm: Arc<Vm>,
    methods: Vec<String>,
}

struct ServerShared {
    mounts: StdRwLock<HashMap<String, Mount>>,
    state: StdRwLock<ServerState>,
    shutdown_tx: StdMutex<Option<mpsc::Sender<()>>>,
    local_addr: StdRwLock<Option<SocketAddr>>,
}

/// The request/response adapter.
pub struct RpcServer {
    config: RpcConfig,
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("addr", &self.local_addr())
            .finish()
    }
}

impl RpcServer {
    /// Create an adapter; call [`RpcServer::listen`] to serve.
    #[must_use]
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            shared: Arc::new(ServerShared {
                mounts: StdRwLock::new(HashMap::new()),
                state: StdRwLock::new(ServerState::Created),
                shutdown_tx: StdMutex::new(None),
                local_addr: StdRwLock::new(None),
            }),
        }
    }

    /// The bound address once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read().expect("addr lock")
    }

    /// Register a VM's exports under `path`, blacklist filtered.
    ///
    /// # Errors
    ///
    /// `RpcError::MountOccupied` when the path is taken; the VM must be
    /// deployed (its exports are snapshotted here).
    pub fn mount(&self, path: &str, vm: Arc<Vm>) -> Result<(), RpcError> {
        let path = normalize_mount(path);
        let methods: Vec<String> = vm
            .exports()
            .map_err(|e| RpcError::MountFailed(e.to_string()))?
            .into_iter()
            .filter(|name| !BLACKLIST.contains(&name.as_str()))
            .collect();
        let mut mounts = self.shared.mounts.write().expect("mounts lock");
        if mounts.contains_key(&path) {
            return Err(RpcError::MountOccupied(path));
        }
        info!(path = %path, vm = %vm.id(), methods = methods.len(), "mounted vm");
        mounts.insert(path, Mount { vm, methods });
        Ok(())
    }

    /// Remove a mount.
    ///
    /// # Errors
    ///
    /// `RpcError::UnknownMount` when nothing is mounted at `path`.
    pub fn unmount(&self, path: &str) -> Result<(), RpcError> {
        let path = normalize_mount(path);
        let mut mounts = self.shared.mounts.write().expect("mounts lock");
        match mounts.remove(&path) {
            Some(_) => {
                info!(path = %path, "unmounted vm");
                Ok(())
            }
            None => Err(RpcError::UnknownMount(path)),
        }
    }

    /// Bind and serve until [`RpcServer::close`].
    ///
    /// # Errors
    ///
    /// `RpcError::AlreadyStarted` on a second listen; bind errors.
    #[instrument(skip(self), fields(port = self.config.port))]
    pub async fn listen(&self) -> Result<(), RpcError> {
        {
            let mut state = self.shared.state.write().expect("state lock");
            if *state != ServerState::Created {
                return Err(RpcError::AlreadyStarted);
            }
            *state = ServerState::Running;
        }
        let listener = TcpListener::bind(("127.0.0.1", self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        *self.shared.local_addr.write().expect("addr lock") = Some(local_addr);
        info!(addr = %local_addr, "rpc adapter listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shared.shutdown_tx.lock().expect("shutdown lock") = Some(shutdown_tx);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "accepted connection");
                                let shared = Arc::clone(&shared);
                                tokio::spawn(async move {
                                    if let Err(error) = serve_connection(stream, shared).await {
                                        debug!(%error, "connection ended with error");
                                    }
                                });
                            }
                            Err(error) => {
                                warn!(%error, "accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            *shared.state.write().expect("state lock") = ServerState::Stopped;
            debug!("accept loop stopped");
        });
        Ok(())
    }

    /// Stop accepting and drop all mounts. Idempotent. Mounted VMs are
    /// not closed — the adapter never owns them.
    pub async fn close(&self) {
        if let Some(tx) = self.shared.shutdown_tx.lock().expect("shutdown lock").take() {
            let _ = tx.send(()).await;
        }
        self.shared.mounts.write().expect("mounts lock").clear();
        info!("rpc adapter closed");
    }
}

impl Mounter for RpcServer {
    fn mount(&self, path: &str, vm: Arc<Vm>) -> Result<(), VmError> {
        RpcServer::mount(self, path, vm).map_err(|e| VmError::Mount(e.to_string()))
    }

    fn unmount(&self, path: &str) -> Result<(), VmError> {
        RpcServer::unmount(self, path).map_err(|e| VmError::Mount(e.to_string()))
    }
}

fn normalize_mount(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

enum Dispatch {
    Immediate(Response),
    Deferred(u64, oneshot::Receiver<Result<Value, VmError>>),
}

/// Map a VM-level failure onto the wire.
fn error_response(id: u64, error: &VmError) -> Response {
    match error {
        VmError::Guest { message } => Response::error(id, ERR_GUEST, message.clone()),
        VmError::QueueFull => Response::error(id, ERR_CAPACITY, "call queue full"),
        VmError::AtCapacity { .. } => Response::error(id, ERR_CAPACITY, error.to_string()),
        VmError::Closed => Response::error(id, ERR_CLOSED, "vm is closed"),
        VmError::NoSuchMethod(name) => Response::error(
            id,
            ERR_METHOD_NOT_SUPPORTED,
            format!("method not supported: {name}"),
        ),
        other => Response::error(id, ERR_INTERNAL, other.to_string()),
    }
}

/// Resolve one request against the mount table. Calls are enqueued
/// *here*, in the read loop, so queue order equals arrival order.
fn dispatch(shared: &ServerShared, request: Request) -> Dispatch {
    let mounts = shared.mounts.read().expect("mounts lock");
    let Some(mount) = mounts.get(&normalize_mount(&request.path)) else {
        return Dispatch::Immediate(Response::error(
            request.id,
            ERR_UNKNOWN_MOUNT,
            format!("unknown mount: {}", request.path),
        ));
    };

    if request.method == "handshake" {
        let body = match handshake_body(mount) {
            Ok(body) => body,
            Err(error) => {
                return Dispatch::Immediate(Response::error(
                    request.id,
                    ERR_INTERNAL,
                    error.to_string(),
                ))
            }
        };
        return Dispatch::Immediate(Response::ok(request.id, body));
    }

    if BLACKLIST.contains(&request.method.as_str())
        || !mount.methods.iter().any(|m| m == &request.method)
    {
        return Dispatch::Immediate(Response::error(
            request.id,
            ERR_METHOD_NOT_SUPPORTED,
            format!("method not supported: {}", request.method),
        ));
    }

    match mount.vm.enqueue_call(CallInvocation {
        method_name: request.method,
        args: request.args,
        user_id: request.user_id,
    }) {
        Ok(receiver) => Dispatch::Deferred(request.id, receiver),
        Err(error) => Dispatch::Immediate(error_response(request.id, &error)),
    }
}

fn handshake_body(mount: &Mount) -> Result<Value, VmError> {
    Ok(Value::object([
        (
            "methods",
            Value::Array(mount.methods.iter().cloned().map(Value::Str).collect()),
        ),
        ("callLogUrl", Value::Str(mount.vm.call_log_url()?)),
        ("filesArchiveUrl", Value::Str(mount.vm.files_archive_url()?)),
    ]))
}

async fn serve_connection(stream: TcpStream, shared: Arc<ServerShared>) -> Result<(), RpcError> {
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    while let Some(payload) = read_frame_bytes(&mut read_half).await? {
        let request: Request = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(error) => {
                // Answer with the reserved code, recovering the request
                // id when the payload is at least JSON.
                let id = serde_json::from_slice::<serde_json::Value>(&payload)
                    .ok()
                    .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
                    .unwrap_or(0);
                let response = Response::error(
                    id,
                    ERR_MALFORMED_REQUEST,
                    format!("malformed request: {error}"),
                );
                send_response(&writer, &response).await?;
                continue;
            }
        };
        match dispatch(&shared, request) {
            Dispatch::Immediate(response) => {
                send_response(&writer, &response).await?;
            }
            Dispatch::Deferred(id, receiver) => {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let response = match receiver.await {
                        Ok(Ok(value)) => Response::ok(id, value),
                        Ok(Err(error)) => error_response(id, &error),
                        Err(_) => Response::error(id, ERR_CLOSED, "vm is closed"),
                    };
                    if let Err(error) = send_response(&writer, &response).await {
                        debug!(%error, "response write failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn send_response(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    response: &Response,
) -> Result<(), RpcError> {
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, response).await
}
