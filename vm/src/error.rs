//! VM error taxonomy.

use thiserror::Error;

use crate::script::ScriptError;
use hindsight_store::StoreError;

/// Errors from VM lifecycle, execution, factory, and replay operations.
#[derive(Debug, Error)]
pub enum VmError {
    /// Storage failure from the log or archive.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The guest script failed to evaluate at deploy.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// A guest method threw. Recorded in the ledger and surfaced verbatim.
    #[error("guest error: {message}")]
    Guest {
        /// Guest-supplied message.
        message: String,
    },
    /// Caller-supplied archive URL disagrees with the deployed state.
    #[error("files archive url mismatch: expected {expected}, found {actual}")]
    UrlMismatch {
        /// URL the caller expected.
        expected: String,
        /// URL actually recorded.
        actual: String,
    },
    /// Replay assertion disagrees with the log's init record.
    #[error("assertion mismatch: expected {expected}, log records {actual}")]
    AssertionMismatch {
        /// Asserted value.
        expected: String,
        /// Value found in the log.
        actual: String,
    },
    /// The log violates the ledger shape.
    #[error("malformed log: {0}")]
    MalformedLog(String),
    /// The call queue is full.
    #[error("call queue full")]
    QueueFull,
    /// The factory is at its child capacity.
    #[error("factory at capacity ({max} vms)")]
    AtCapacity {
        /// Configured bound.
        max: usize,
    },
    /// The named method is not exported.
    #[error("method not supported: {0}")]
    NoSuchMethod(String),
    /// A second call was issued while one was still pending. Calls must be
    /// serialized by the caller or the queue; this is a programmer error.
    #[error("call issued while another is pending")]
    CallOverlap,
    /// Operation on a VM that is closed or closing.
    #[error("vm is closed")]
    Closed,
    /// Operation requires a deployed VM.
    #[error("vm is not deployed")]
    NotDeployed,
    /// Unknown child VM id.
    #[error("unknown vm: {0}")]
    UnknownVm(String),
    /// Mount bookkeeping failure from the RPC adapter.
    #[error("mount error: {0}")]
    Mount(String),
}
