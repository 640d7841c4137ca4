//! The append-only log collaborator.
//!
//! [`AppendOnlyLog`] is the contract the core consumes; the distribution
//! layer behind it is out of scope. [`JournalLog`] is the bundled
//! implementation over [`Journal`], either file-backed (with a header
//! record carrying the log's durable URL) or memory-backed (for fetched
//! copies and replay scratch).

use std::path::Path;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{Journal, StoreError};

/// File name of a log journal inside its directory.
const LOG_FILE: &str = "log.jnl";

/// An append-only sequence of opaque entry payloads with a durable URL.
///
/// Entries are indexed from 0. Appends are atomic: an entry is observable
/// via `get` iff it is durably committed.
#[async_trait]
pub trait AppendOnlyLog: Send + Sync {
    /// Durable identifier of this log.
    fn url(&self) -> &str;

    /// Current entry count.
    fn len(&self) -> u64;

    /// True when the log holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one entry payload, returning its sequence number.
    async fn append(&self, payload: &[u8]) -> Result<u64, StoreError>;

    /// Fetch the payload at `seq`, or `None` past the end.
    async fn get(&self, seq: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Watch the entry count; receivers wake on every append.
    fn watch_len(&self) -> watch::Receiver<u64>;
}

/// Generate a fresh durable URL with the given scheme.
#[must_use]
pub(crate) fn fresh_url(scheme: &str) -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    let hex: String = key.iter().map(|b| format!("{b:02x}")).collect();
    format!("{scheme}://{hex}")
}

#[derive(Debug, Serialize, Deserialize)]
struct LogHeader {
    url: String,
}

/// Journal-backed [`AppendOnlyLog`].
///
/// File-backed logs reserve journal record 0 for the header; entry `seq`
/// lives at journal index `seq + base`.
pub struct JournalLog {
    url: String,
    journal: Journal,
    /// Journal index of entry 0 (1 when a header record is present).
    base: u64,
    len_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for JournalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalLog")
            .field("url", &self.url)
            .field("len", &self.len())
            .finish()
    }
}

impl JournalLog {
    /// Create a fresh file-backed log at `dir`, assigning a new URL.
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if `dir` already holds a log.
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        Self::create_with_url(dir, fresh_url("apl"))
    }

    /// Create a fresh file-backed log carrying a preassigned URL (used for
    /// fetched copies, which keep their origin identity).
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if `dir` already holds a log.
    pub fn create_with_url(dir: &Path, url: String) -> Result<Self, StoreError> {
        let journal = Journal::create(&dir.join(LOG_FILE))?;
        let header = serde_json::to_vec(&LogHeader { url: url.clone() })
            .expect("header serialization is infallible");
        journal.append(&header)?;
        Ok(Self::from_parts(url, journal, 1))
    }

    /// Open an existing file-backed log.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` when `dir` holds no log; `MalformedLog` when
    /// the header record is missing or unreadable.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let journal = Journal::open(&dir.join(LOG_FILE))?;
        let header = journal
            .get(0)
            .ok_or_else(|| StoreError::MalformedLog("missing log header".to_string()))?;
        let header: LogHeader = serde_json::from_slice(&header)
            .map_err(|e| StoreError::MalformedLog(format!("bad log header: {e}")))?;
        Ok(Self::from_parts(header.url, journal, 1))
    }

    /// A memory-backed log with the given URL.
    #[must_use]
    pub fn memory(url: String) -> Self {
        Self::from_parts(url, Journal::in_memory(), 0)
    }

    /// A memory-backed log preloaded with fetched entry payloads.
    ///
    /// # Errors
    ///
    /// Propagates journal append failures.
    pub fn from_records(url: String, records: &[Vec<u8>]) -> Result<Self, StoreError> {
        let log = Self::memory(url);
        for record in records {
            let journal_seq = log.journal.append(record)?;
            let _ = log.len_tx.send(journal_seq + 1);
        }
        Ok(log)
    }

    fn from_parts(url: String, journal: Journal, base: u64) -> Self {
        let (len_tx, _) = watch::channel(journal.len().saturating_sub(base));
        Self {
            url,
            journal,
            base,
            len_tx,
        }
    }
}

#[async_trait]
impl AppendOnlyLog for JournalLog {
    fn url(&self) -> &str {
        &self.url
    }

    fn len(&self) -> u64 {
        self.journal.len().saturating_sub(self.base)
    }

    async fn append(&self, payload: &[u8]) -> Result<u64, StoreError> {
        let journal_seq = self.journal.append(payload)?;
        let seq = journal_seq - self.base;
        let _ = self.len_tx.send(seq + 1);
        Ok(seq)
    }

    async fn get(&self, seq: u64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.journal.get(seq + self.base))
    }

    fn watch_len(&self) -> watch::Receiver<u64> {
        self.len_tx.subscribe()
    }
}
