//! Checksummed append-only record store.
//!
//! The journal is the durable primitive under both the call log and the
//! archive change history. One record per line:
//!
//! ```text
//! <sha256-hex-of-payload> <payload>\n
//! ```
//!
//! where the payload is a single JSON document with no embedded newlines.
//! An append is fsynced before it is acknowledged, so a record is
//! observable iff it is durable. On open, a torn tail (final line without
//! its newline, or failing its checksum) is truncated; a bad record that is
//! *followed by* valid records means the file was damaged, not torn, and
//! opening fails instead of dropping history.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::warn;

use crate::StoreError;

/// Hex digest width of a record checksum.
const CHECKSUM_LEN: usize = 64;

fn checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

enum Backing {
    File { file: File, path: PathBuf },
    Memory,
}

struct Inner {
    backing: Backing,
    records: Vec<Vec<u8>>,
}

/// An append-only sequence of checksummed records.
pub struct Journal {
    inner: Mutex<Inner>,
    len_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("len", &self.len()).finish()
    }
}

impl Journal {
    /// Create a fresh journal file.
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if `path` exists; I/O errors otherwise.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self::from_parts(
            Backing::File {
                file,
                path: path.to_path_buf(),
            },
            Vec::new(),
        ))
    }

    /// Open an existing journal file, truncating a torn tail if one is
    /// present.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the file is absent, `StoreError::Corrupt`
    /// if a non-tail record fails validation.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let (records, good_len) = replay(&raw)?;
        if good_len < raw.len() {
            warn!(
                path = %path.display(),
                dropped = raw.len() - good_len,
                "truncating torn journal tail"
            );
            file.set_len(good_len as u64)?;
            file.sync_all()?;
            file.seek(SeekFrom::End(0))?;
        }
        Ok(Self::from_parts(
            Backing::File {
                file,
                path: path.to_path_buf(),
            },
            records,
        ))
    }

    /// A journal with no disk behind it.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_parts(Backing::Memory, Vec::new())
    }

    fn from_parts(backing: Backing, records: Vec<Vec<u8>>) -> Self {
        let (len_tx, _) = watch::channel(records.len() as u64);
        Self {
            inner: Mutex::new(Inner { backing, records }),
            len_tx,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> u64 {
        *self.len_tx.borrow()
    }

    /// True when no records have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the record count; receivers wake on every append.
    #[must_use]
    pub fn watch_len(&self) -> watch::Receiver<u64> {
        self.len_tx.subscribe()
    }

    /// Append one record; durable before this returns.
    ///
    /// # Errors
    ///
    /// `StoreError::Corrupt` if the payload embeds a newline (it could not
    /// be replayed); I/O errors otherwise.
    pub fn append(&self, payload: &[u8]) -> Result<u64, StoreError> {
        if payload.contains(&b'\n') {
            return Err(StoreError::Corrupt {
                line: self.len() + 1,
                reason: "payload contains a newline".to_string(),
            });
        }
        let mut inner = self.inner.lock().expect("journal lock");
        if let Backing::File { file, .. } = &mut inner.backing {
            let mut line = Vec::with_capacity(payload.len() + CHECKSUM_LEN + 2);
            line.extend_from_slice(checksum(payload).as_bytes());
            line.push(b' ');
            line.extend_from_slice(payload);
            line.push(b'\n');
            file.write_all(&line)?;
            file.sync_all()?;
        }
        inner.records.push(payload.to_vec());
        let len = inner.records.len() as u64;
        let _ = self.len_tx.send(len);
        Ok(len - 1)
    }

    /// Fetch a record by index.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("journal lock");
        inner.records.get(index as usize).cloned()
    }

    /// Records in the half-open index range, clamped to the journal.
    #[must_use]
    pub fn get_range(&self, start: u64, end: u64) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().expect("journal lock");
        let len = inner.records.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        if start >= end {
            return Vec::new();
        }
        inner.records[start..end].to_vec()
    }

    /// Drop every record at index `keep` and beyond, rewriting the backing
    /// file. Used by archive revert; never part of normal appending.
    ///
    /// # Errors
    ///
    /// I/O errors from the rewrite.
    pub fn truncate(&self, keep: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("journal lock");
        let keep = keep as usize;
        if keep >= inner.records.len() {
            return Ok(());
        }
        inner.records.truncate(keep);
        if let Backing::File { path, .. } = &inner.backing {
            let path = path.clone();
            let tmp = path.with_extension("jnl.tmp");
            {
                let mut out = File::create(&tmp)?;
                for payload in &inner.records {
                    out.write_all(checksum(payload).as_bytes())?;
                    out.write_all(b" ")?;
                    out.write_all(payload)?;
                    out.write_all(b"\n")?;
                }
                out.sync_all()?;
            }
            std::fs::rename(&tmp, &path)?;
            let file = OpenOptions::new().read(true).append(true).open(&path)?;
            inner.backing = Backing::File { file, path };
        }
        let len = inner.records.len() as u64;
        let _ = self.len_tx.send(len);
        Ok(())
    }
}

/// Replay raw journal bytes into records, returning the byte length of the
/// valid prefix. A bad tail is reported by a shorter prefix; a bad interior
/// record is an error.
fn replay(raw: &[u8]) -> Result<(Vec<Vec<u8>>, usize), StoreError> {
    let mut records = Vec::new();
    let mut good_len = 0usize;
    let mut offset = 0usize;
    let mut line_no = 0u64;

    while offset < raw.len() {
        line_no += 1;
        let rest = &raw[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            // Torn tail: final line never got its newline.
            return Ok((records, good_len));
        };
        let line = &rest[..newline];
        match parse_line(line) {
            Ok(payload) => {
                records.push(payload);
                offset += newline + 1;
                good_len = offset;
            }
            Err(reason) => {
                let at_tail = offset + newline + 1 >= raw.len();
                if at_tail {
                    return Ok((records, good_len));
                }
                return Err(StoreError::Corrupt {
                    line: line_no,
                    reason,
                });
            }
        }
    }
    Ok((records, good_len))
}

fn parse_line(line: &[u8]) -> Result<Vec<u8>, String> {
    if line.len() < CHECKSUM_LEN + 1 || line[CHECKSUM_LEN] != b' ' {
        return Err("bad record framing".to_string());
    }
    let (digest, payload) = (&line[..CHECKSUM_LEN], &line[CHECKSUM_LEN + 1..]);
    let digest = std::str::from_utf8(digest).map_err(|_| "non-utf8 checksum".to_string())?;
    if checksum(payload) != digest {
        return Err("checksum mismatch".to_string());
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jnl");
        {
            let journal = Journal::create(&path).unwrap();
            journal.append(br#"{"a":1}"#).unwrap();
            journal.append(br#"{"b":2}"#).unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.get(1).unwrap(), br#"{"b":2}"#.to_vec());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jnl");
        Journal::create(&path).unwrap();
        assert!(matches!(
            Journal::create(&path),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jnl");
        {
            let journal = Journal::create(&path).unwrap();
            journal.append(br#"{"a":1}"#).unwrap();
        }
        // Simulate a crash mid-append.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"deadbeef {\"b\"").unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 1);
        // The file itself was repaired.
        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn interior_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jnl");
        {
            let journal = Journal::create(&path).unwrap();
            journal.append(br#"{"a":1}"#).unwrap();
            journal.append(br#"{"b":2}"#).unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        raw[2] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(
            Journal::open(&path),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn truncate_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jnl");
        let journal = Journal::create(&path).unwrap();
        for i in 0..5 {
            journal.append(format!("{{\"i\":{i}}}").as_bytes()).unwrap();
        }
        journal.truncate(2).unwrap();
        assert_eq!(journal.len(), 2);
        drop(journal);
        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.get(1).unwrap(), br#"{"i":1}"#.to_vec());
    }

    #[tokio::test]
    async fn watch_wakes_on_append() {
        let journal = Journal::in_memory();
        let mut rx = journal.watch_len();
        journal.append(br#"{}"#).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
