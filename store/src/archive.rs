//! The versioned files archive.
//!
//! An archive is a monotonically versioned filesystem: version 1 is the
//! creation record, and every successful mutation appends one change
//! record and advances the version by exactly one. File contents live in a
//! content-addressed blob store; the visible tree is the fold of the
//! change journal ([`ArchiveTree`]). That makes `history` a journal read
//! and `revert_to` — the crash-repair path — a journal truncation plus
//! refold.
//!
//! [`VersionedArchive`] is the collaborator contract; [`Archive`] is the
//! bundled implementation, directory-backed or memory-backed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::log::fresh_url;
use crate::tree::Node;
use crate::{ArchiveTree, ChangeOp, ChangeRecord, Journal, StoreError};

/// File name of the change journal inside an archive directory.
const CHANGES_FILE: &str = "changes.jnl";
/// Blob directory name inside an archive directory.
const BLOBS_DIR: &str = "blobs";

/// Node kind reported by `stat` and `read_dir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
}

/// Result of `stat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryStat {
    /// Normalized absolute path.
    pub path: String,
    /// Node kind.
    pub kind: EntryKind,
    /// Content size in bytes; 0 for directories.
    pub size: u64,
}

/// One `read_dir` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Child name (no path separators).
    pub name: String,
    /// Node kind.
    pub kind: EntryKind,
}

/// Half-open version range for `history`; `None` bounds default to the
/// full history.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryRange {
    /// First version included (default 1).
    pub start: Option<u64>,
    /// First version excluded (default: one past the current version).
    pub end: Option<u64>,
}

/// A versioned append-only filesystem with a durable URL.
///
/// Reads never advance the version; each successful mutation advances it
/// by exactly one and returns the version it produced.
#[async_trait]
pub trait VersionedArchive: Send + Sync {
    /// Durable identifier of this archive.
    fn url(&self) -> &str;

    /// Human-readable title recorded at creation.
    fn title(&self) -> &str;

    /// Current version (1 = freshly created).
    fn version(&self) -> u64;

    /// Stat a node.
    async fn stat(&self, path: &str) -> Result<EntryStat, StoreError>;

    /// Read a file's bytes.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// List a directory's immediate children.
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, StoreError>;

    /// Change records over a version range.
    async fn history(&self, range: HistoryRange) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Write (create or overwrite) a file.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<u64, StoreError>;

    /// Create an explicit directory.
    async fn mkdir(&self, path: &str) -> Result<u64, StoreError>;

    /// Remove a file.
    async fn unlink(&self, path: &str) -> Result<u64, StoreError>;

    /// Remove a directory; `recursive` permits removing a populated one.
    async fn rmdir(&self, path: &str, recursive: bool) -> Result<u64, StoreError>;

    /// Roll the archive back to an earlier version. Blobs are retained;
    /// only the visible history shrinks.
    async fn revert_to(&self, version: u64) -> Result<(), StoreError>;

    /// Every file path currently in the tree, in path order.
    async fn list_tree(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveHeader {
    url: String,
    title: String,
}

enum BlobStore {
    Dir(PathBuf),
    Memory(Mutex<HashMap<String, Vec<u8>>>),
}

impl BlobStore {
    fn put(&self, data: &[u8]) -> Result<String, StoreError> {
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(data);
            format!("{:x}", hasher.finalize())
        };
        match self {
            BlobStore::Dir(dir) => {
                let path = dir.join(&digest);
                if !path.exists() {
                    let tmp = dir.join(format!("{digest}.tmp"));
                    std::fs::write(&tmp, data)?;
                    std::fs::rename(&tmp, &path)?;
                }
            }
            BlobStore::Memory(map) => {
                map.lock()
                    .expect("blob lock")
                    .entry(digest.clone())
                    .or_insert_with(|| data.to_vec());
            }
        }
        Ok(digest)
    }

    fn get(&self, digest: &str) -> Result<Vec<u8>, StoreError> {
        match self {
            BlobStore::Dir(dir) => {
                let path = dir.join(digest);
                std::fs::read(&path).map_err(|_| StoreError::Corrupt {
                    line: 0,
                    reason: format!("missing blob {digest}"),
                })
            }
            BlobStore::Memory(map) => map
                .lock()
                .expect("blob lock")
                .get(digest)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt {
                    line: 0,
                    reason: format!("missing blob {digest}"),
                }),
        }
    }
}

/// Journal-backed [`VersionedArchive`], directory- or memory-backed.
pub struct Archive {
    url: String,
    title: String,
    journal: Journal,
    blobs: BlobStore,
    tree: RwLock<ArchiveTree>,
    /// Serializes version assignment across mutations.
    mutate: Mutex<()>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("url", &self.url)
            .field("title", &self.title)
            .field("version", &self.version())
            .finish()
    }
}

impl Archive {
    /// Create a fresh directory-backed archive with a new URL.
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` when `dir` already holds an archive.
    pub fn create(dir: &Path, title: &str) -> Result<Self, StoreError> {
        Self::create_with_url(dir, title, fresh_url("varc"))
    }

    /// Create a fresh directory-backed archive carrying a preassigned
    /// URL (derived child identities and replay reconstructions).
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` when `dir` already holds an archive.
    pub fn create_with_url(dir: &Path, title: &str, url: String) -> Result<Self, StoreError> {
        let journal = Journal::create(&dir.join(CHANGES_FILE))?;
        let blobs_dir = dir.join(BLOBS_DIR);
        std::fs::create_dir_all(&blobs_dir)?;
        let header = serde_json::to_vec(&ArchiveHeader {
            url: url.clone(),
            title: title.to_string(),
        })
        .expect("header serialization is infallible");
        journal.append(&header)?;
        Ok(Self {
            url,
            title: title.to_string(),
            journal,
            blobs: BlobStore::Dir(blobs_dir),
            tree: RwLock::new(ArchiveTree::default()),
            mutate: Mutex::new(()),
        })
    }

    /// Reopen a directory-backed archive.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` when `dir` holds no archive; `Corrupt` when
    /// its journal does not fold.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let journal = Journal::open(&dir.join(CHANGES_FILE))?;
        let header = journal
            .get(0)
            .ok_or_else(|| StoreError::MalformedLog("missing archive header".to_string()))?;
        let header: ArchiveHeader = serde_json::from_slice(&header)
            .map_err(|e| StoreError::MalformedLog(format!("bad archive header: {e}")))?;
        let tree = fold_tree(&journal)?;
        Ok(Self {
            url: header.url,
            title: header.title,
            journal,
            blobs: BlobStore::Dir(dir.join(BLOBS_DIR)),
            tree: RwLock::new(tree),
            mutate: Mutex::new(()),
        })
    }

    /// A fresh memory-backed archive with a new URL.
    #[must_use]
    pub fn memory(title: &str) -> Self {
        Self::memory_with_url(title, fresh_url("varc"))
    }

    /// A fresh memory-backed archive carrying a preassigned URL (replay
    /// scratch claiming the identity of the archive it reconstructs).
    #[must_use]
    pub fn memory_with_url(title: &str, url: String) -> Self {
        let journal = Journal::in_memory();
        let header = serde_json::to_vec(&ArchiveHeader {
            url: url.clone(),
            title: title.to_string(),
        })
        .expect("header serialization is infallible");
        journal
            .append(&header)
            .expect("memory journal append cannot fail");
        Self {
            url,
            title: title.to_string(),
            journal,
            blobs: BlobStore::Memory(Mutex::new(HashMap::new())),
            tree: RwLock::new(ArchiveTree::default()),
            mutate: Mutex::new(()),
        }
    }

    fn record_for(&self, version: u64) -> Result<ChangeRecord, StoreError> {
        if version == 1 {
            return Ok(ChangeRecord {
                version: 1,
                op: ChangeOp::Created,
                path: None,
                blob: None,
                size: None,
            });
        }
        let raw = self
            .journal
            .get(version - 1)
            .ok_or_else(|| StoreError::NotFound(format!("version {version}")))?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
            line: version,
            reason: e.to_string(),
        })
    }

    /// Validate and commit one mutation under the version lock.
    fn commit(
        &self,
        op: ChangeOp,
        path: &str,
        blob: Option<String>,
        size: Option<u64>,
        validate: impl FnOnce(&ArchiveTree) -> Result<(), StoreError>,
    ) -> Result<u64, StoreError> {
        let _guard = self.mutate.lock().expect("archive mutate lock");
        {
            let tree = self.tree.read().expect("archive tree lock");
            validate(&tree)?;
        }
        let record = ChangeRecord {
            version: self.journal.len() + 1,
            op,
            path: Some(path.to_string()),
            blob,
            size,
        };
        let payload = serde_json::to_vec(&record).expect("record serialization is infallible");
        self.journal.append(&payload)?;
        self.tree
            .write()
            .expect("archive tree lock")
            .apply(&record)?;
        Ok(record.version)
    }
}

fn fold_tree(journal: &Journal) -> Result<ArchiveTree, StoreError> {
    let mut tree = ArchiveTree::default();
    for index in 1..journal.len() {
        let raw = journal.get(index).expect("index below len");
        let record: ChangeRecord =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
                line: index + 1,
                reason: e.to_string(),
            })?;
        tree.apply(&record)?;
    }
    Ok(tree)
}

#[async_trait]
impl VersionedArchive for Archive {
    fn url(&self) -> &str {
        &self.url
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn version(&self) -> u64 {
        self.journal.len()
    }

    async fn stat(&self, path: &str) -> Result<EntryStat, StoreError> {
        let tree = self.tree.read().expect("archive tree lock");
        match tree.lookup(path) {
            Some(Node::File { size, .. }) => Ok(EntryStat {
                path: path.to_string(),
                kind: EntryKind::File,
                size: *size,
            }),
            Some(Node::Dir) => Ok(EntryStat {
                path: path.to_string(),
                kind: EntryKind::Dir,
                size: 0,
            }),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let blob = {
            let tree = self.tree.read().expect("archive tree lock");
            match tree.lookup(path) {
                Some(Node::File { blob, .. }) => blob.clone(),
                Some(Node::Dir) => return Err(StoreError::NotAFile(path.to_string())),
                None => return Err(StoreError::NotFound(path.to_string())),
            }
        };
        self.blobs.get(&blob)
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let tree = self.tree.read().expect("archive tree lock");
        match tree.lookup(path) {
            Some(Node::Dir) => {}
            Some(Node::File { .. }) => return Err(StoreError::NotADirectory(path.to_string())),
            None => return Err(StoreError::NotFound(path.to_string())),
        }
        let rows = tree
            .list_dir(path)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, node)| DirEntry {
                name,
                kind: match node {
                    Node::File { .. } => EntryKind::File,
                    Node::Dir => EntryKind::Dir,
                },
            })
            .collect();
        Ok(rows)
    }

    async fn history(&self, range: HistoryRange) -> Result<Vec<ChangeRecord>, StoreError> {
        let current = self.version();
        let start = range.start.unwrap_or(1).max(1);
        let end = range.end.unwrap_or(current + 1).min(current + 1);
        let mut out = Vec::new();
        for version in start..end {
            out.push(self.record_for(version)?);
        }
        Ok(out)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<u64, StoreError> {
        if path == "/" {
            return Err(StoreError::NotAFile("/".to_string()));
        }
        let blob = self.blobs.put(data)?;
        let size = data.len() as u64;
        self.commit(ChangeOp::Write, path, Some(blob), Some(size), |tree| {
            match tree.lookup(path) {
                Some(Node::Dir) => Err(StoreError::NotAFile(path.to_string())),
                _ => Ok(()),
            }
        })
    }

    async fn mkdir(&self, path: &str) -> Result<u64, StoreError> {
        if path == "/" {
            return Err(StoreError::AlreadyExists(PathBuf::from("/")));
        }
        self.commit(ChangeOp::Mkdir, path, None, None, |tree| {
            match tree.lookup(path) {
                Some(Node::File { .. }) => Err(StoreError::NotADirectory(path.to_string())),
                Some(Node::Dir) => Err(StoreError::AlreadyExists(PathBuf::from(path))),
                None => Ok(()),
            }
        })
    }

    async fn unlink(&self, path: &str) -> Result<u64, StoreError> {
        self.commit(ChangeOp::Unlink, path, None, None, |tree| {
            match tree.lookup(path) {
                Some(Node::File { .. }) => Ok(()),
                Some(Node::Dir) => Err(StoreError::NotAFile(path.to_string())),
                None => Err(StoreError::NotFound(path.to_string())),
            }
        })
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<u64, StoreError> {
        if path == "/" {
            return Err(StoreError::PathEscape("/".to_string()));
        }
        self.commit(ChangeOp::Rmdir, path, None, None, |tree| {
            match tree.lookup(path) {
                Some(Node::Dir) => {
                    let populated = tree
                        .list_dir(path)
                        .is_some_and(|children| !children.is_empty());
                    if populated && !recursive {
                        return Err(StoreError::DirectoryNotEmpty(path.to_string()));
                    }
                    Ok(())
                }
                Some(Node::File { .. }) => Err(StoreError::NotADirectory(path.to_string())),
                None => Err(StoreError::NotFound(path.to_string())),
            }
        })
    }

    async fn revert_to(&self, version: u64) -> Result<(), StoreError> {
        let _guard = self.mutate.lock().expect("archive mutate lock");
        let current = self.journal.len();
        if version == 0 || version > current {
            return Err(StoreError::InvalidRevert {
                requested: version,
                current,
            });
        }
        self.journal.truncate(version)?;
        let tree = fold_tree(&self.journal)?;
        *self.tree.write().expect("archive tree lock") = tree;
        Ok(())
    }

    async fn list_tree(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tree.read().expect("archive tree lock").file_paths())
    }
}
