//! Call-log entry schemas.
//!
//! A call log is an ordered sequence of typed entries. Sequence 0 is always
//! an `init` entry binding the guest code to its files archive; every later
//! sequence is a `call` entry recording one invocation together with the
//! archive version observed after it returned.
//!
//! Field order is fixed by struct declaration order and object keys sort,
//! so `to_canonical_bytes` is byte-stable and suitable for hashing and
//! ledger comparison.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Value;

/// Reserved entry type for future host-trusted effectful calls. The core
/// rejects it until the extension lands.
const ORACLE_TYPE: &str = "oracle";

/// Errors raised while decoding ledger entries.
#[derive(Debug, Error)]
pub enum EntryError {
    /// The record is not a JSON object with a string `type` field, or a
    /// known type failed schema validation.
    #[error("malformed log entry: {0}")]
    Malformed(String),
    /// The reserved `oracle` entry type was encountered.
    #[error("oracle entries are reserved and not accepted")]
    OracleRejected,
}

/// A typed call-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEntry {
    /// Sequence-0 entry: guest code and archive binding.
    Init(InitEntry),
    /// One recorded invocation.
    Call(CallEntry),
}

impl LogEntry {
    /// Canonical JSON bytes of this entry.
    #[must_use]
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("entry serialization is infallible")
    }

    /// Decode an entry, requiring a known type.
    ///
    /// # Errors
    ///
    /// `EntryError::Malformed` on shape violations, `OracleRejected` for the
    /// reserved type.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntryError> {
        match decode_entry(bytes)? {
            DecodedEntry::Known(entry) => Ok(entry),
            DecodedEntry::Unknown { entry_type } => Err(EntryError::Malformed(format!(
                "unknown entry type `{entry_type}`"
            ))),
        }
    }

    /// The init view of this entry, if it is one.
    #[must_use]
    pub fn as_init(&self) -> Option<&InitEntry> {
        match self {
            LogEntry::Init(init) => Some(init),
            LogEntry::Call(_) => None,
        }
    }

    /// The call view of this entry, if it is one.
    #[must_use]
    pub fn as_call(&self) -> Option<&CallEntry> {
        match self {
            LogEntry::Call(call) => Some(call),
            LogEntry::Init(_) => None,
        }
    }
}

/// The sequence-0 record: immutable guest code plus the durable identifier
/// of the files archive the log is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitEntry {
    /// The guest script, verbatim.
    pub code: String,
    /// Durable URL of the bound files archive.
    pub files_archive_url: String,
}

/// One recorded invocation: what was called, and what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEntry {
    /// The invocation.
    pub call: CallRequest,
    /// The observed outcome.
    pub result: CallResult,
}

/// The request half of a call entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Exported method name.
    pub method_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Authenticated caller, when the transport supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The result half of a call entry. Exactly one of `res`/`err` is present,
/// or neither when the method returned nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    /// Archive version observed after the call returned.
    pub files_version: u64,
    /// Successful result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<Value>,
    /// Guest error, when the method threw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<GuestErrorPayload>,
}

/// The logged shape of a guest error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestErrorPayload {
    /// Guest-supplied message, verbatim.
    pub message: String,
}

/// Outcome of decoding one raw ledger record.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEntry {
    /// A schema-valid entry of a known type.
    Known(LogEntry),
    /// A well-formed record of a type this build does not know. Replay
    /// skips these for forward compatibility.
    Unknown {
        /// The record's `type` field.
        entry_type: String,
    },
}

/// Decode one raw ledger record, tolerating unknown entry types.
///
/// # Errors
///
/// `EntryError::Malformed` when the record is not an object with a string
/// `type`, or a known type fails validation; `OracleRejected` for the
/// reserved `oracle` type.
pub fn decode_entry(bytes: &[u8]) -> Result<DecodedEntry, EntryError> {
    let raw: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| EntryError::Malformed(e.to_string()))?;
    let entry_type = raw
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| EntryError::Malformed("missing `type` field".to_string()))?;
    match entry_type {
        "init" | "call" => serde_json::from_value::<LogEntry>(raw.clone())
            .map(DecodedEntry::Known)
            .map_err(|e| EntryError::Malformed(e.to_string())),
        ORACLE_TYPE => Err(EntryError::OracleRejected),
        other => Ok(DecodedEntry::Unknown {
            entry_type: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_entry_wire_shape() {
        let entry = LogEntry::Init(InitEntry {
            code: "method f() { 1 }".to_string(),
            files_archive_url: "varc://abc".to_string(),
        });
        let text = String::from_utf8(entry.to_canonical_bytes()).unwrap();
        assert_eq!(
            text,
            r#"{"type":"init","code":"method f() { 1 }","filesArchiveUrl":"varc://abc"}"#
        );
    }

    #[test]
    fn call_entry_omits_absent_fields() {
        let entry = LogEntry::Call(CallEntry {
            call: CallRequest {
                method_name: "f".to_string(),
                args: vec![],
                user_id: None,
            },
            result: CallResult {
                files_version: 1,
                res: None,
                err: None,
            },
        });
        let text = String::from_utf8(entry.to_canonical_bytes()).unwrap();
        assert_eq!(
            text,
            r#"{"type":"call","call":{"methodName":"f","args":[]},"result":{"filesVersion":1}}"#
        );
    }

    #[test]
    fn round_trip_is_byte_stable() {
        let entry = LogEntry::Call(CallEntry {
            call: CallRequest {
                method_name: "w".to_string(),
                args: vec![Value::Str("foo".to_string())],
                user_id: Some("alice".to_string()),
            },
            result: CallResult {
                files_version: 2,
                res: Some(Value::Int(7)),
                err: None,
            },
        });
        let bytes = entry.to_canonical_bytes();
        let back = LogEntry::from_bytes(&bytes).unwrap();
        assert_eq!(back.to_canonical_bytes(), bytes);
    }

    #[test]
    fn oracle_entries_are_rejected() {
        let err = decode_entry(br#"{"type":"oracle","key":"k"}"#).unwrap_err();
        assert!(matches!(err, EntryError::OracleRejected));
    }

    #[test]
    fn unknown_types_are_reported_not_fatal() {
        let decoded = decode_entry(br#"{"type":"checkpoint","at":4}"#).unwrap();
        assert_eq!(
            decoded,
            DecodedEntry::Unknown {
                entry_type: "checkpoint".to_string()
            }
        );
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(matches!(
            decode_entry(br#"{"code":"x"}"#),
            Err(EntryError::Malformed(_))
        ));
    }
}
