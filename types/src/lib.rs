//! Core wire types for the hindsight auditable execution environment.
//!
//! This crate defines the two vocabularies every other crate speaks:
//!
//! - [`Value`]: the closed sum of guest-visible, wire-encodable values
//!   (null, booleans, numbers, strings, byte strings, arrays, objects).
//! - [`LogEntry`]: the typed call-log entry schemas (`init`, `call`) with
//!   their canonical JSON encoding, which is the byte-stable form that
//!   ledger verification compares.
//!
//! Both encode deterministically: object keys are `BTreeMap`-ordered and
//! struct fields serialize in declaration order, so re-encoding a decoded
//! entry reproduces its bytes.

mod entry;
mod value;

pub use entry::{
    decode_entry, CallEntry, CallRequest, CallResult, DecodedEntry, EntryError, GuestErrorPayload,
    InitEntry, LogEntry,
};
pub use value::Value;
