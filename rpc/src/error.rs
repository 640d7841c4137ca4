//! RPC adapter errors.

use thiserror::Error;

/// Errors raised by the adapter and client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket-level failure.
    #[error("rpc i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),
    /// An inbound frame exceeded the size bound.
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    /// The server is already listening.
    #[error("server already started")]
    AlreadyStarted,
    /// `listen` has not been called.
    #[error("server is not listening")]
    NotListening,
    /// A mount path is already taken.
    #[error("mount path occupied: {0}")]
    MountOccupied(String),
    /// Mounting failed because the VM was not ready.
    #[error("mount failed: {0}")]
    MountFailed(String),
    /// No mount under the path.
    #[error("unknown mount: {0}")]
    UnknownMount(String),
    /// The peer answered with an error body.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Wire error code.
        code: i64,
        /// Peer-supplied message.
        message: String,
    },
    /// The connection ended mid-exchange.
    #[error("connection closed")]
    ConnectionClosed,
}
