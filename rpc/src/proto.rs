//! Wire messages and framing.
//!
//! One frame is a `u32` big-endian payload length followed by one JSON
//! document. Requests correlate to responses by `id`; responses may
//! arrive out of order when calls to different mounts interleave.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use hindsight_types::Value;

use crate::RpcError;

/// Upper bound on a single frame.
pub(crate) const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reserved code: unknown, unexported, or blacklisted method.
pub const ERR_METHOD_NOT_SUPPORTED: i64 = -32601;
/// The request failed to decode or referenced nothing.
pub const ERR_MALFORMED_REQUEST: i64 = -32600;
/// The guest method threw; the message is the guest's, verbatim.
pub const ERR_GUEST: i64 = -32000;
/// The target VM's call queue is full.
pub const ERR_CAPACITY: i64 = -32001;
/// The target VM is closed or closing.
pub const ERR_CLOSED: i64 = -32002;
/// No mount under the requested path.
pub const ERR_UNKNOWN_MOUNT: i64 = -32004;
/// Adapter-side failure that is none of the above.
pub const ERR_INTERNAL: i64 = -32603;

/// One client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation id, chosen by the client.
    pub id: u64,
    /// Mount path.
    pub path: String,
    /// Method name; `handshake` is reserved and answered by the adapter.
    pub method: String,
    /// Authenticated user id from the transport metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// One server response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id echoed from the request.
    pub id: u64,
    /// Result value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<Value>,
    /// Error body on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorBody>,
}

impl Response {
    /// A success response.
    #[must_use]
    pub fn ok(id: u64, res: Value) -> Self {
        Self {
            id,
            res: match res {
                Value::Null => None,
                other => Some(other),
            },
            err: None,
        }
    }

    /// An error response.
    #[must_use]
    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            res: None,
            err: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Wire error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code; `-32601` is reserved for unsupported methods.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// Write one frame.
pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).map_err(|e| RpcError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw frame payload; `Ok(None)` on a clean EOF at a frame
/// boundary. The server decodes payloads itself so a request that fails
/// to decode can still be answered.
pub(crate) async fn read_frame_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Read one frame; `Ok(None)` on a clean EOF at a frame boundary.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame_bytes(reader).await? {
        Some(payload) => {
            let message =
                serde_json::from_slice(&payload).map_err(|e| RpcError::Codec(e.to_string()))?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}
