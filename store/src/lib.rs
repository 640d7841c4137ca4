//! Durable storage for the hindsight auditable VM.
//!
//! Two durable structures back every VM:
//!
//! - the **call log** ([`CallLog`]): an append-only ledger of typed entries
//!   over the [`AppendOnlyLog`] collaborator trait, and
//! - the **files archive** ([`Archive`]): a versioned filesystem modelled as
//!   a left fold of change records over content-addressed blobs, behind the
//!   [`VersionedArchive`] collaborator trait.
//!
//! Both sit on the same primitive, a checksummed append-only [`Journal`]
//! whose appends are durable before they are observable. The
//! [`ContentNetwork`] trait is the seam to the distribution layer; the
//! in-process [`LocalNetwork`] stands in for it here.
//!
//! The guest never touches an archive directly: the [`FilesAdaptor`]
//! restricts it to an enumerated, path-sandboxed operation set.

mod archive;
mod call_log;
mod error;
mod files;
mod journal;
mod log;
mod network;
mod tree;

pub use archive::{Archive, DirEntry, EntryKind, EntryStat, HistoryRange, VersionedArchive};
pub use call_log::{CallLog, GetOptions};
pub use error::StoreError;
pub use files::{Encoding, FilesAdaptor};
pub use journal::Journal;
pub use log::{AppendOnlyLog, JournalLog};
pub use network::{ContentNetwork, LocalNetwork};
pub use tree::{ArchiveTree, ChangeOp, ChangeRecord};
