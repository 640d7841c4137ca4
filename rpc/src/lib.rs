//! Request/response adapter for mounted VMs.
//!
//! Bidirectional framing over TCP: a `u32` big-endian length prefix, then
//! one JSON document. Each mount serves a VM's exports under a path;
//! `handshake` returns the method list plus the durable URLs a third
//! party needs to fetch and audit the VM. Incoming calls are queued on
//! the target VM, which serializes execution; the adapter itself never
//! runs guest code.

mod client;
mod error;
mod proto;
mod server;

pub use client::{Handshake, RpcClient};
pub use error::RpcError;
pub use proto::{
    ErrorBody, Request, Response, ERR_CAPACITY, ERR_CLOSED, ERR_GUEST, ERR_INTERNAL,
    ERR_MALFORMED_REQUEST, ERR_METHOD_NOT_SUPPORTED, ERR_UNKNOWN_MOUNT,
};
pub use server::{RpcConfig, RpcServer};
