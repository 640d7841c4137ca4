//! The verifier: byte-equality over ledgers and archives.
//!
//! A mismatch says the two histories diverged — because the guest is
//! nondeterministic or because someone tampered. The verifier never says
//! which; it only finds the first divergence.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use hindsight_store::{CallLog, StoreError, VersionedArchive};
use hindsight_types::DecodedEntry;

/// Verification failures.
#[derive(Debug, Error)]
pub enum VerifierError {
    /// The logs hold different entry counts.
    #[error("log length mismatch: {a} vs {b}")]
    LengthMismatch {
        /// Left length.
        a: u64,
        /// Right length.
        b: u64,
    },
    /// Entries at a sequence differ under canonical encoding.
    #[error("log entries diverge at sequence {seq}")]
    LogMismatch {
        /// First diverging sequence.
        seq: u64,
        /// Canonical form on the left.
        a: String,
        /// Canonical form on the right.
        b: String,
    },
    /// The archives are at different versions.
    #[error("archive version mismatch: {a} vs {b}")]
    VersionMismatch {
        /// Left version.
        a: u64,
        /// Right version.
        b: u64,
    },
    /// A path exists in one archive but not the other, or its bytes
    /// differ.
    #[error("archives diverge at {path}")]
    ArchiveMismatch {
        /// First diverging path.
        path: String,
    },
    /// Reading either side failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Compare two call logs entry-by-entry under canonical encoding.
///
/// # Errors
///
/// The first divergence found, or a store error from reading either log.
pub async fn compare_logs(a: &CallLog, b: &CallLog) -> Result<(), VerifierError> {
    if a.len() != b.len() {
        return Err(VerifierError::LengthMismatch {
            a: a.len(),
            b: b.len(),
        });
    }
    for seq in 0..a.len() {
        let left = canonical_entry(a, seq).await?;
        let right = canonical_entry(b, seq).await?;
        if left != right {
            return Err(VerifierError::LogMismatch {
                seq,
                a: left,
                b: right,
            });
        }
    }
    Ok(())
}

async fn canonical_entry(log: &CallLog, seq: u64) -> Result<String, VerifierError> {
    let raw = log
        .as_log()
        .get(seq)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("sequence {seq}")))?;
    match hindsight_types::decode_entry(&raw).map_err(StoreError::from)? {
        DecodedEntry::Known(entry) => Ok(String::from_utf8_lossy(&entry.to_canonical_bytes())
            .into_owned()),
        DecodedEntry::Unknown { .. } => Ok(String::from_utf8_lossy(&raw).into_owned()),
    }
}

/// Compare two archives: versions, directory structure, and file bytes.
///
/// # Errors
///
/// The first divergence found, or a store error from reading either
/// archive.
pub async fn compare_archives(
    a: &Arc<dyn VersionedArchive>,
    b: &Arc<dyn VersionedArchive>,
) -> Result<(), VerifierError> {
    if a.version() != b.version() {
        return Err(VerifierError::VersionMismatch {
            a: a.version(),
            b: b.version(),
        });
    }
    let (files_a, dirs_a) = walk(a).await?;
    let (files_b, dirs_b) = walk(b).await?;
    if let Some(path) = first_difference(&dirs_a, &dirs_b) {
        return Err(VerifierError::ArchiveMismatch { path });
    }
    if let Some(path) = first_difference(&files_a, &files_b) {
        return Err(VerifierError::ArchiveMismatch { path });
    }
    for path in &files_a {
        let left = a.read_file(path).await?;
        let right = b.read_file(path).await?;
        if left != right {
            return Err(VerifierError::ArchiveMismatch { path: path.clone() });
        }
    }
    Ok(())
}

/// Breadth-first walk from the root; returns (files, directories).
async fn walk(
    archive: &Arc<dyn VersionedArchive>,
) -> Result<(BTreeSet<String>, BTreeSet<String>), VerifierError> {
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();
    let mut pending = vec!["/".to_string()];
    while let Some(dir) = pending.pop() {
        for row in archive.read_dir(&dir).await? {
            let path = if dir == "/" {
                format!("/{}", row.name)
            } else {
                format!("{dir}/{}", row.name)
            };
            match row.kind {
                hindsight_store::EntryKind::File => {
                    files.insert(path);
                }
                hindsight_store::EntryKind::Dir => {
                    dirs.insert(path.clone());
                    pending.push(path);
                }
            }
        }
    }
    Ok((files, dirs))
}

fn first_difference(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<String> {
    a.symmetric_difference(b).next().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hindsight_store::Archive;

    #[tokio::test]
    async fn identical_archives_verify() {
        let a = Archive::memory("t");
        let b = Archive::memory("t");
        for archive in [&a, &b] {
            archive.write_file("/x/y", b"same").await.unwrap();
        }
        let a: Arc<dyn VersionedArchive> = Arc::new(a);
        let b: Arc<dyn VersionedArchive> = Arc::new(b);
        compare_archives(&a, &b).await.unwrap();
    }

    #[tokio::test]
    async fn content_divergence_is_reported_with_its_path() {
        let a = Archive::memory("t");
        let b = Archive::memory("t");
        a.write_file("/f", b"one").await.unwrap();
        b.write_file("/f", b"two").await.unwrap();
        let a: Arc<dyn VersionedArchive> = Arc::new(a);
        let b: Arc<dyn VersionedArchive> = Arc::new(b);
        let err = compare_archives(&a, &b).await.unwrap_err();
        assert!(matches!(
            err,
            VerifierError::ArchiveMismatch { path } if path == "/f"
        ));
    }

    #[tokio::test]
    async fn version_skew_is_reported_first() {
        let a = Archive::memory("t");
        let b = Archive::memory("t");
        a.write_file("/f", b"x").await.unwrap();
        let a: Arc<dyn VersionedArchive> = Arc::new(a);
        let b: Arc<dyn VersionedArchive> = Arc::new(b);
        assert!(matches!(
            compare_archives(&a, &b).await.unwrap_err(),
            VerifierError::VersionMismatch { a: 2, b: 1 }
        ));
    }
}
