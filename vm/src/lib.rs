//! The hindsight execution kernel.
//!
//! A host runs guest scripts inside a curated sandbox; every invocation —
//! arguments, result or error, and the files-archive version observed
//! afterward — is appended to an auditable call ledger. Third parties
//! fetch the ledger, rebuild the VM by replay, and verify the histories
//! byte-for-byte.
//!
//! # Architecture
//!
//! - **Script engine** ([`script`]): a small deterministic guest language;
//!   its `method` definitions are the VM's exports.
//! - **Sandbox** ([`sandbox`]): the enumerated `system.*` capability
//!   surface — caller slot, files adaptor, host-installed namespaces.
//! - **Kernel** ([`Vm`]): serialized call execution with log-after-execute
//!   recording, a bounded FIFO call queue, and idempotent close.
//! - **Factory** ([`Factory`]): a VM provisioning child VMs through a
//!   native `system.vms` namespace, child registry, and mount seam.
//! - **Replay** ([`ReplayAssertions`], [`Vm::from_call_log`]): rebuilds a
//!   VM from a fetched ledger.
//! - **Verifier** ([`verify`]): byte-equality over ledgers and archives.

pub mod sandbox;
pub mod script;
pub mod verify;

mod error;
mod factory;
mod replay;
mod vm;

pub use error::VmError;
pub use factory::{Factory, FactoryConfig, Mounter};
pub use replay::{replay_fetched, ReplayAssertions, ReplayOptions};
pub use sandbox::{CallerSlot, Sandbox, SystemNamespace, SystemSurface};
pub use script::ScriptError;
pub use vm::{CallInvocation, DeployOptions, StoreIdentity, Vm, VmConfig, VmPhase};
