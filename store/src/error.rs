//! Storage error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the journal, log, and archive layers.
///
/// Store errors abort the enclosing operation and surface to the caller;
/// an interrupted append leaves the store in its pre-append state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Creation target already holds a store.
    #[error("store already exists at {0}")]
    AlreadyExists(PathBuf),
    /// No store at the given location, or no resource under the given URL.
    #[error("not found: {0}")]
    NotFound(String),
    /// A non-tail record failed validation; the store is damaged rather
    /// than merely torn.
    #[error("corrupt record at line {line}: {reason}")]
    Corrupt {
        /// One-based line number of the bad record.
        line: u64,
        /// What failed.
        reason: String,
    },
    /// The log exists but violates the ledger shape (e.g. sequence 0 is
    /// not `init`).
    #[error("malformed log: {0}")]
    MalformedLog(String),
    /// Entry-level decode failure.
    #[error(transparent)]
    Entry(#[from] hindsight_types::EntryError),
    /// A `wait`ing read ran out its timeout.
    #[error("timed out waiting for entry")]
    Timeout,
    /// A guest path resolved above the archive root.
    #[error("path escapes archive root: {0}")]
    PathEscape(String),
    /// A path was not absolute or contained an empty final component.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Operation expected a file.
    #[error("not a file: {0}")]
    NotAFile(String),
    /// Operation expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Non-recursive removal of a populated directory.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    /// Encoding/decoding of file content failed.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Revert requested a version outside the journal's history.
    #[error("cannot revert to version {requested} (current {current})")]
    InvalidRevert {
        /// Requested version.
        requested: u64,
        /// Current version.
        current: u64,
    },
}
