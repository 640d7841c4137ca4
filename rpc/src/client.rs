//! The adapter client.
//!
//! Correlates responses by id, so calls may be dispatched back-to-back
//! and awaited out of order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use hindsight_types::Value;

use crate::proto::{read_frame, write_frame, Request, Response};
use crate::RpcError;

/// The server's answer to `handshake`.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Remotely callable method names.
    pub methods: Vec<String>,
    /// Durable URL of the VM's call log.
    pub call_log_url: String,
    /// Durable URL of the VM's files archive.
    pub files_archive_url: String,
}

/// A connected RPC client.
pub struct RpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<StdMutex<HashMap<u64, oneshot::Sender<Response>>>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl RpcClient {
    /// Connect to an adapter.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut read_half, write_half) = stream.into_split();
        let pending: Arc<StdMutex<HashMap<u64, oneshot::Sender<Response>>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame::<_, Response>(&mut read_half).await {
                    Ok(Some(response)) => {
                        let waiter = reader_pending
                            .lock()
                            .expect("pending lock")
                            .remove(&response.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!(id = response.id, "response with no waiter"),
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(%error, "client reader stopped");
                        break;
                    }
                }
            }
            // Fail anything still pending.
            reader_pending.lock().expect("pending lock").clear();
        });

        Ok(Self {
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    /// Send one request; the response arrives on the returned channel.
    /// Requests sent back-to-back reach the server in send order.
    ///
    /// # Errors
    ///
    /// Write errors.
    pub async fn dispatch(
        &self,
        path: &str,
        method: &str,
        user_id: Option<&str>,
        args: Vec<Value>,
    ) -> Result<oneshot::Receiver<Response>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);
        let request = Request {
            id,
            path: path.to_string(),
            method: method.to_string(),
            user_id: user_id.map(str::to_string),
            args,
        };
        let mut writer = self.writer.lock().await;
        if let Err(error) = write_frame(&mut *writer, &request).await {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(error);
        }
        Ok(rx)
    }

    /// Call one remote method and await its result.
    ///
    /// # Errors
    ///
    /// `RpcError::Remote` with the server's code and message on failure.
    pub async fn call(
        &self,
        path: &str,
        method: &str,
        user_id: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let receiver = self.dispatch(path, method, user_id, args).await?;
        let response = receiver.await.map_err(|_| RpcError::ConnectionClosed)?;
        match response.err {
            Some(body) => Err(RpcError::Remote {
                code: body.code,
                message: body.message,
            }),
            None => Ok(response.res.unwrap_or(Value::Null)),
        }
    }

    /// Perform the discovery handshake for a mount.
    ///
    /// # Errors
    ///
    /// Remote errors; `RpcError::Codec` when the body is malformed.
    pub async fn handshake(&self, path: &str) -> Result<Handshake, RpcError> {
        let body = self.call(path, "handshake", None, vec![]).await?;
        let map = body
            .as_object()
            .ok_or_else(|| RpcError::Codec("handshake body is not an object".to_string()))?;
        let methods = map
            .get("methods")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let field = |name: &str| -> Result<String, RpcError> {
            map.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RpcError::Codec(format!("handshake missing {name}")))
        };
        Ok(Handshake {
            methods,
            call_log_url: field("callLogUrl")?,
            files_archive_url: field("filesArchiveUrl")?,
        })
    }
}
