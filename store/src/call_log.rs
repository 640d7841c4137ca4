//! The typed call log.
//!
//! A thin facade over [`AppendOnlyLog`] that owns the ledger shape:
//! sequence 0 is always the `init` entry, every later sequence is a `call`
//! entry, and entries are immutable once appended. Random access supports
//! waiting for an entry that has not yet replicated, which is how a
//! follower tails a fetched log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hindsight_types::{decode_entry, CallEntry, DecodedEntry, InitEntry, LogEntry};

use crate::{AppendOnlyLog, ContentNetwork, JournalLog, StoreError};

/// Options for [`CallLog::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Block until the entry is locally available.
    pub wait: bool,
    /// Give up after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// An append-only ledger of `init` and `call` entries.
#[derive(Clone)]
pub struct CallLog {
    log: Arc<dyn AppendOnlyLog>,
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog")
            .field("url", &self.url())
            .field("len", &self.len())
            .finish()
    }
}

impl CallLog {
    /// Initialize a fresh log at `dir`, seeded with its sequence-0 `init`
    /// entry.
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if `dir` already holds a log.
    pub async fn create(
        dir: &Path,
        code: &str,
        files_archive_url: &str,
    ) -> Result<Self, StoreError> {
        Self::seed(JournalLog::create(dir)?, code, files_archive_url).await
    }

    /// [`CallLog::create`] with a preassigned log URL (derived child
    /// identities and replay reconstructions).
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if `dir` already holds a log.
    pub async fn create_with_url(
        dir: &Path,
        url: String,
        code: &str,
        files_archive_url: &str,
    ) -> Result<Self, StoreError> {
        Self::seed(JournalLog::create_with_url(dir, url)?, code, files_archive_url).await
    }

    async fn seed(
        log: JournalLog,
        code: &str,
        files_archive_url: &str,
    ) -> Result<Self, StoreError> {
        let init = LogEntry::Init(InitEntry {
            code: code.to_string(),
            files_archive_url: files_archive_url.to_string(),
        });
        log.append(&init.to_canonical_bytes()).await?;
        Ok(Self { log: Arc::new(log) })
    }

    /// Initialize a fresh memory-backed log (replay scratch space),
    /// seeded with its sequence-0 `init` entry.
    ///
    /// # Errors
    ///
    /// Propagates append failures.
    pub async fn create_in_memory(
        code: &str,
        files_archive_url: &str,
    ) -> Result<Self, StoreError> {
        Self::seed(
            JournalLog::memory(crate::log::fresh_url("apl")),
            code,
            files_archive_url,
        )
        .await
    }

    /// [`CallLog::create_in_memory`] with a preassigned log URL.
    ///
    /// # Errors
    ///
    /// Propagates append failures.
    pub async fn create_in_memory_with_url(
        url: String,
        code: &str,
        files_archive_url: &str,
    ) -> Result<Self, StoreError> {
        Self::seed(JournalLog::memory(url), code, files_archive_url).await
    }

    /// Open an existing log, verifying the ledger shape.
    ///
    /// # Errors
    ///
    /// `StoreError::MalformedLog` when sequence 0 is absent or not `init`.
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let log = Self {
            log: Arc::new(JournalLog::open(dir)?),
        };
        log.init_entry().await?;
        Ok(log)
    }

    /// Fetch a remote log by URL. With `dir`, the copy is file-backed and
    /// reopenable; without, it is memory-backed.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` for unknown URLs; `MalformedLog` when the
    /// fetched entries violate the ledger shape.
    pub async fn fetch(
        network: &dyn ContentNetwork,
        url: &str,
        dir: Option<&Path>,
    ) -> Result<Self, StoreError> {
        let records = network.fetch_log(url).await?;
        let log: Arc<dyn AppendOnlyLog> = match dir {
            Some(dir) => {
                let copy = JournalLog::create_with_url(dir, url.to_string())?;
                for record in &records {
                    copy.append(record).await?;
                }
                Arc::new(copy)
            }
            None => Arc::new(JournalLog::from_records(url.to_string(), &records)?),
        };
        let log = Self { log };
        log.init_entry().await?;
        Ok(log)
    }

    /// Wrap an existing collaborator log without shape validation.
    #[must_use]
    pub fn from_log(log: Arc<dyn AppendOnlyLog>) -> Self {
        Self { log }
    }

    /// Durable identifier of this log.
    #[must_use]
    pub fn url(&self) -> &str {
        self.log.url()
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.log.len()
    }

    /// True when the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// The underlying collaborator log.
    #[must_use]
    pub fn as_log(&self) -> &Arc<dyn AppendOnlyLog> {
        &self.log
    }

    /// The sequence-0 `init` entry.
    ///
    /// # Errors
    ///
    /// `StoreError::MalformedLog` when sequence 0 is absent or not `init`.
    pub async fn init_entry(&self) -> Result<InitEntry, StoreError> {
        let raw = self
            .log
            .get(0)
            .await?
            .ok_or_else(|| StoreError::MalformedLog("log is empty".to_string()))?;
        match decode_entry(&raw)? {
            DecodedEntry::Known(LogEntry::Init(init)) => Ok(init),
            _ => Err(StoreError::MalformedLog(
                "sequence 0 is not an init entry".to_string(),
            )),
        }
    }

    /// Random access by sequence number.
    ///
    /// Without `wait`, returns `Ok(None)` past the end. With `wait`,
    /// blocks until the entry is available or the timeout lapses.
    ///
    /// # Errors
    ///
    /// `StoreError::Timeout` when a bounded wait lapses; decode errors for
    /// damaged entries.
    pub async fn get(
        &self,
        seq: u64,
        options: GetOptions,
    ) -> Result<Option<DecodedEntry>, StoreError> {
        if seq >= self.log.len() {
            if !options.wait {
                return Ok(None);
            }
            self.wait_for(seq, options.timeout).await?;
        }
        let raw = self.log.get(seq).await?;
        match raw {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn wait_for(&self, seq: u64, timeout: Option<Duration>) -> Result<(), StoreError> {
        let mut lengths = self.log.watch_len();
        let reached = async {
            loop {
                if *lengths.borrow_and_update() > seq {
                    return Ok(());
                }
                if lengths.changed().await.is_err() {
                    return Err(StoreError::Timeout);
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, reached)
                .await
                .map_err(|_| StoreError::Timeout)?,
            None => reached.await,
        }
    }

    /// Decoded entries over the half-open sequence range; `None` bounds
    /// default to the full log.
    ///
    /// # Errors
    ///
    /// Decode errors for damaged entries.
    pub async fn entries(
        &self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<(u64, DecodedEntry)>, StoreError> {
        let len = self.log.len();
        let start = start.unwrap_or(0).min(len);
        let end = end.unwrap_or(len).min(len);
        let mut out = Vec::new();
        for seq in start..end {
            let raw = self
                .log
                .get(seq)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("sequence {seq}")))?;
            out.push((seq, decode_entry(&raw)?));
        }
        Ok(out)
    }

    /// Append one call record. Used by the VM's execution path and by
    /// replay; everything else treats the log as read-only.
    ///
    /// # Errors
    ///
    /// Store errors from the underlying append.
    pub async fn append_call(&self, entry: CallEntry) -> Result<u64, StoreError> {
        let entry = LogEntry::Call(entry);
        self.log.append(&entry.to_canonical_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hindsight_types::{CallRequest, CallResult, Value};

    fn call(method: &str, version: u64) -> CallEntry {
        CallEntry {
            call: CallRequest {
                method_name: method.to_string(),
                args: vec![Value::Int(1)],
                user_id: None,
            },
            result: CallResult {
                files_version: version,
                res: Some(Value::Int(2)),
                err: None,
            },
        }
    }

    #[tokio::test]
    async fn create_seeds_init_at_sequence_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = CallLog::create(dir.path(), "method f() { 1 }", "varc://a")
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        let init = log.init_entry().await.unwrap();
        assert_eq!(init.code, "method f() { 1 }");
        assert_eq!(init.files_archive_url, "varc://a");
    }

    #[tokio::test]
    async fn open_rejects_missing_init() {
        let dir = tempfile::tempdir().unwrap();
        {
            let raw = JournalLog::create(dir.path()).unwrap();
            let entry = LogEntry::Call(call("f", 1));
            raw.append(&entry.to_canonical_bytes()).await.unwrap();
        }
        assert!(matches!(
            CallLog::open(dir.path()).await,
            Err(StoreError::MalformedLog(_))
        ));
    }

    #[tokio::test]
    async fn get_wait_blocks_until_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = CallLog::create(dir.path(), "code", "varc://a").await.unwrap();
        let reader = log.clone();
        let waiter = tokio::spawn(async move {
            reader
                .get(
                    1,
                    GetOptions {
                        wait: true,
                        timeout: Some(Duration::from_secs(5)),
                    },
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append_call(call("f", 1)).await.unwrap();
        let entry = waiter.await.unwrap().unwrap().unwrap();
        assert!(matches!(entry, DecodedEntry::Known(LogEntry::Call(_))));
    }

    #[tokio::test]
    async fn get_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let log = CallLog::create(dir.path(), "code", "varc://a").await.unwrap();
        let result = log
            .get(
                3,
                GetOptions {
                    wait: true,
                    timeout: Some(Duration::from_millis(30)),
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Timeout)));
    }

    #[tokio::test]
    async fn entries_respects_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = CallLog::create(dir.path(), "code", "varc://a").await.unwrap();
        log.append_call(call("f", 1)).await.unwrap();
        log.append_call(call("g", 1)).await.unwrap();
        let all = log.entries(None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        let tail = log.entries(Some(1), None).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 1);
    }
}
